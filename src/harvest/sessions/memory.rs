//! In-memory browser session backed by canned snapshot payloads.
//!
//! Every selector resolves to the feed containers; scripts are answered by
//! name. The feed can be made to render lazily so that expansion has
//! something to converge on, and containers can carry carousel slides that
//! become visible as their indicators are clicked.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::harvest::scripts;
use crate::traits::{BrowserSession, ElementRef, Interaction, Key, PageScript, SessionError};

/// One container: the raw payload the snapshot script would have produced,
/// plus the media visible after activating each carousel indicator.
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    payload: Value,
    slides: Vec<Vec<String>>,
    broken_indicators: HashSet<usize>,
}

impl MemoryContainer {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            slides: Vec::new(),
            broken_indicators: HashSet::new(),
        }
    }

    pub fn with_slides(mut self, slides: Vec<Vec<String>>) -> Self {
        self.slides = slides;
        self
    }

    /// Clicking this indicator fails.
    pub fn with_broken_indicator(mut self, indicator: usize) -> Self {
        self.broken_indicators.insert(indicator);
        self
    }

    fn static_media(&self) -> Value {
        self.payload
            .get("media")
            .and_then(|m| m.get("attributes"))
            .cloned()
            .unwrap_or_else(|| json!([]))
    }
}

#[derive(Debug)]
struct MemoryState {
    containers: Vec<MemoryContainer>,
    rendered: usize,
    growth_step: usize,
    scroll_offset: i64,
    active_slides: HashMap<usize, usize>,
    triggers: usize,
    clicks: usize,
    navigations: Vec<String>,
    input_broken: bool,
    pinned: bool,
    unreachable: bool,
    snapshot_override: Option<Value>,
}

#[derive(Debug)]
pub struct MemorySession {
    state: Mutex<MemoryState>,
}

const VIEWPORT_STEP: i64 = 600;

impl MemorySession {
    /// All containers rendered up front.
    pub fn new(containers: Vec<MemoryContainer>) -> Self {
        let rendered = containers.len();
        Self {
            state: Mutex::new(MemoryState {
                containers,
                rendered,
                growth_step: 0,
                scroll_offset: 0,
                active_slides: HashMap::new(),
                triggers: 0,
                clicks: 0,
                navigations: Vec::new(),
                input_broken: false,
                pinned: false,
                unreachable: false,
                snapshot_override: None,
            }),
        }
    }

    /// Builds a session from a captured snapshot (the JSON array returned by
    /// the snapshot script).
    pub fn from_snapshot(snapshot: Value) -> Result<Self, SessionError> {
        match snapshot {
            Value::Array(items) => Ok(Self::new(
                items.into_iter().map(MemoryContainer::new).collect(),
            )),
            _ => Err(SessionError::Protocol(
                "captured snapshot must be a JSON array".to_string(),
            )),
        }
    }

    /// Renders `initial` containers and `step` more on every growth trigger.
    pub fn with_lazy_rendering(self, initial: usize, step: usize) -> Self {
        {
            let mut state = self.lock();
            state.rendered = initial.min(state.containers.len());
            state.growth_step = step;
        }
        self
    }

    /// Simulated scroll and key input fails.
    pub fn with_broken_input(self) -> Self {
        self.lock().input_broken = true;
        self
    }

    /// Simulated input succeeds but neither moves the page nor grows the
    /// feed; only synthetic wheel events do.
    pub fn with_pinned_viewport(self) -> Self {
        self.lock().pinned = true;
        self
    }

    /// Navigation and readiness checks fail.
    pub fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    pub fn with_snapshot_override(self, value: Value) -> Self {
        self.lock().snapshot_override = Some(value);
        self
    }

    pub fn rendered(&self) -> usize {
        self.lock().rendered
    }

    /// Growth triggers received (End key or synthetic wheel script).
    pub fn triggers(&self) -> usize {
        self.lock().triggers
    }

    pub fn clicks(&self) -> usize {
        self.lock().clicks
    }

    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryState {
    fn grow(&mut self) {
        self.triggers += 1;
        self.rendered = (self.rendered + self.growth_step).min(self.containers.len());
    }

    fn snapshot(&self) -> Value {
        if let Some(value) = &self.snapshot_override {
            return value.clone();
        }
        let items = self.containers[..self.rendered]
            .iter()
            .enumerate()
            .map(|(ordinal, container)| {
                let mut payload = container.payload.clone();
                if let Value::Object(map) = &mut payload {
                    map.entry("ordinal").or_insert_with(|| json!(ordinal));
                }
                payload
            })
            .collect();
        Value::Array(items)
    }

    fn visible_media(&self, ordinal: usize) -> Value {
        let Some(container) = self.containers.get(ordinal) else {
            return json!({ "attributes": [] });
        };
        match self
            .active_slides
            .get(&ordinal)
            .and_then(|slide| container.slides.get(*slide))
        {
            Some(urls) => json!({ "attributes": urls }),
            None => json!({ "attributes": container.static_media() }),
        }
    }
}

fn parse_ref(element: &ElementRef) -> Option<(&str, Vec<usize>)> {
    let mut parts = element.0.split(':');
    let kind = parts.next()?;
    let indexes = parts.map(|p| p.parse().ok()).collect::<Option<Vec<usize>>>()?;
    Some((kind, indexes))
}

#[async_trait]
impl BrowserSession for MemorySession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(SessionError::Transport(format!("cannot reach {}", url)));
        }
        state.navigations.push(url.to_string());
        Ok(())
    }

    async fn query(&self, script: PageScript) -> Result<Value, SessionError> {
        let mut state = self.lock();
        match script.name {
            scripts::SNAPSHOT => Ok(state.snapshot()),
            scripts::VISIBLE_MEDIA => {
                let ordinal = script
                    .args
                    .get(1)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| SessionError::Script {
                        name: script.name.to_string(),
                        message: "missing container ordinal".to_string(),
                    })?;
                Ok(state.visible_media(ordinal as usize))
            }
            scripts::WHEEL_SCROLL => {
                let before = state.scroll_offset;
                state.grow();
                state.scroll_offset += VIEWPORT_STEP;
                Ok(json!({
                    "before": before,
                    "after": state.scroll_offset,
                    "moved": true
                }))
            }
            scripts::SCROLL_OFFSET => Ok(json!(state.scroll_offset)),
            scripts::READY_STATE => Ok(json!("complete")),
            other => Err(SessionError::Script {
                name: other.to_string(),
                message: "unknown script".to_string(),
            }),
        }
    }

    async fn find(&self, _selector: &str) -> Result<Vec<ElementRef>, SessionError> {
        let state = self.lock();
        Ok((0..state.rendered)
            .map(|i| ElementRef(format!("container:{}", i)))
            .collect())
    }

    async fn find_within(
        &self,
        parent: &ElementRef,
        _selector: &str,
    ) -> Result<Vec<ElementRef>, SessionError> {
        let state = self.lock();
        match parse_ref(parent) {
            Some(("container", indexes)) if indexes.len() == 1 => {
                let ordinal = indexes[0];
                let container = state
                    .containers
                    .get(ordinal)
                    .ok_or_else(|| SessionError::NoSuchElement(parent.0.clone()))?;
                Ok((0..container.slides.len())
                    .map(|k| ElementRef(format!("indicator:{}:{}", ordinal, k)))
                    .collect())
            }
            _ => Err(SessionError::NoSuchElement(parent.0.clone())),
        }
    }

    async fn interact(&self, interaction: Interaction) -> Result<(), SessionError> {
        let mut state = self.lock();
        match interaction {
            Interaction::ScrollBy { dy, .. } => {
                if state.input_broken {
                    return Err(SessionError::Interaction("wheel input rejected".to_string()));
                }
                if !state.pinned {
                    state.scroll_offset += dy;
                }
                Ok(())
            }
            Interaction::Press(key) => {
                if state.input_broken {
                    return Err(SessionError::Interaction("key input rejected".to_string()));
                }
                if state.pinned {
                    return Ok(());
                }
                match key {
                    Key::End => {
                        state.grow();
                        state.scroll_offset += VIEWPORT_STEP;
                    }
                    Key::PageDown | Key::ArrowDown => state.scroll_offset += 40,
                }
                Ok(())
            }
            Interaction::Click(element) => match parse_ref(&element) {
                Some(("indicator", indexes)) if indexes.len() == 2 => {
                    let (ordinal, slide) = (indexes[0], indexes[1]);
                    let container = state
                        .containers
                        .get(ordinal)
                        .ok_or_else(|| SessionError::NoSuchElement(element.0.clone()))?;
                    if container.broken_indicators.contains(&slide) {
                        return Err(SessionError::Interaction(format!(
                            "{} is not clickable",
                            element.0
                        )));
                    }
                    state.active_slides.insert(ordinal, slide);
                    state.clicks += 1;
                    Ok(())
                }
                _ => Err(SessionError::NoSuchElement(element.0.clone())),
            },
        }
    }

    async fn await_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        if self.lock().unreachable {
            return Err(SessionError::NotReady(timeout));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(n: usize) -> Vec<MemoryContainer> {
        (0..n)
            .map(|i| MemoryContainer::new(json!({ "id": format!("c{}", i) })))
            .collect()
    }

    #[tokio::test]
    async fn test_snapshot_assigns_ordinals_to_rendered_containers() {
        let session = MemorySession::new(feed(5)).with_lazy_rendering(2, 2);
        let snapshot = session
            .query(scripts::snapshot("div", &Default::default()))
            .await
            .unwrap();
        let items = snapshot.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["ordinal"], 1);
        assert_eq!(items[1]["id"], "c1");
    }

    #[tokio::test]
    async fn test_end_key_grows_until_exhausted() {
        let session = MemorySession::new(feed(5)).with_lazy_rendering(2, 2);
        for _ in 0..3 {
            session.interact(Interaction::Press(Key::End)).await.unwrap();
        }
        assert_eq!(session.rendered(), 5);
        assert_eq!(session.triggers(), 3);
        assert_eq!(session.find("div").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_from_snapshot_requires_array() {
        assert!(MemorySession::from_snapshot(json!({"not": "array"})).is_err());
        let session = MemorySession::from_snapshot(json!([{ "id": "x" }])).unwrap();
        assert_eq!(session.rendered(), 1);
    }

    #[tokio::test]
    async fn test_unknown_script_is_rejected() {
        let session = MemorySession::new(Vec::new());
        let script = PageScript {
            name: "mystery",
            body: "return 1;",
            args: Vec::new(),
        };
        assert!(matches!(
            session.query(script).await,
            Err(SessionError::Script { .. })
        ));
    }
}
