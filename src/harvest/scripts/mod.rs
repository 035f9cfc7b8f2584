//! Page scripts issued through [`BrowserSession::query`].
//!
//! Scripts only gather raw candidates from the DOM; every filtering and
//! fallback decision is made on the Rust side.
//!
//! [`BrowserSession::query`]: crate::traits::BrowserSession::query

use serde_json::{json, Value};

use crate::config::StrategyConfig;
use crate::traits::PageScript;

pub const SNAPSHOT: &str = "snapshot";
pub const VISIBLE_MEDIA: &str = "visible_media";
pub const WHEEL_SCROLL: &str = "wheel_scroll";
pub const SCROLL_OFFSET: &str = "scroll_offset";
pub const READY_STATE: &str = "ready_state";

/// Batched snapshot of every container matching `container_selector`.
pub fn snapshot(container_selector: &str, strategies: &StrategyConfig) -> PageScript {
    PageScript {
        name: SNAPSHOT,
        body: include_str!("snapshot.js"),
        args: vec![
            Value::String(container_selector.to_string()),
            serde_json::to_value(strategies).unwrap_or(Value::Null),
        ],
    }
}

/// Media currently rendered inside the container at `ordinal`.
pub fn visible_media(
    container_selector: &str,
    ordinal: usize,
    strategies: &StrategyConfig,
) -> PageScript {
    PageScript {
        name: VISIBLE_MEDIA,
        body: include_str!("visible_media.js"),
        args: vec![
            json!(container_selector),
            json!(ordinal),
            json!(strategies.media_attributes),
            json!(strategies.media_elements),
        ],
    }
}

/// Synthetic wheel events, used when simulated input does not move the page.
pub fn wheel_scroll(events: u32, delta: i64) -> PageScript {
    PageScript {
        name: WHEEL_SCROLL,
        body: include_str!("wheel_scroll.js"),
        args: vec![json!(events), json!(delta)],
    }
}

pub fn scroll_offset() -> PageScript {
    PageScript {
        name: SCROLL_OFFSET,
        body: "return window.pageYOffset || document.documentElement.scrollTop || 0;",
        args: Vec::new(),
    }
}

pub fn ready_state() -> PageScript {
    PageScript {
        name: READY_STATE,
        body: "return document.readyState;",
        args: Vec::new(),
    }
}
