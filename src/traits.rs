use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Browser transport failed: {0}")]
    Transport(String),
    #[error("Script '{name}' failed: {message}")]
    Script { name: String, message: String },
    #[error("Element not found: {0}")]
    NoSuchElement(String),
    #[error("Interaction failed: {0}")]
    Interaction(String),
    #[error("Page not ready after {0:?}")]
    NotReady(Duration),
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

/// Opaque handle to an element inside the browser session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

/// A named script executed in the page. `body` follows the WebDriver
/// `execute/sync` convention: it reads `arguments[n]` and `return`s a value.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub name: &'static str,
    pub body: &'static str,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    PageDown,
    End,
    ArrowDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    /// Pointer-wheel scroll relative to the viewport.
    ScrollBy { dx: i64, dy: i64 },
    /// Key press delivered to the focused document.
    Press(Key),
    Click(ElementRef),
}

/// Capability interface over a live browser page.
///
/// The harvest core only talks to the page through this trait, so how the
/// session was obtained (driver discovery, login) stays outside the crate.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    /// Runs a script against the current page and returns its JSON result.
    async fn query(&self, script: PageScript) -> Result<Value, SessionError>;

    async fn find(&self, selector: &str) -> Result<Vec<ElementRef>, SessionError>;

    async fn find_within(
        &self,
        parent: &ElementRef,
        selector: &str,
    ) -> Result<Vec<ElementRef>, SessionError>;

    async fn interact(&self, interaction: Interaction) -> Result<(), SessionError>;

    /// Waits until the document reports itself loaded.
    async fn await_ready(&self, timeout: Duration) -> Result<(), SessionError>;
}
