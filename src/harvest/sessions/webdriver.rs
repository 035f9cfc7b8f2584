//! [`BrowserSession`] over the W3C WebDriver wire protocol.
//!
//! Attaches to a session that something else already created and logged in
//! (chromedriver, geckodriver, a Selenium grid). The harvester never creates
//! or deletes the session itself.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::harvest::scripts;
use crate::traits::{BrowserSession, ElementRef, Interaction, Key, PageScript, SessionError};

/// Property name WebDriver uses for element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
    poll_interval: Duration,
}

impl WebDriverSession {
    /// Attaches to `session_id` on the WebDriver server at `endpoint`.
    ///
    /// `request_timeout` bounds every individual protocol call; long
    /// scripts must finish within it.
    pub fn attach(
        endpoint: &str,
        session_id: &str,
        request_timeout: Duration,
    ) -> Result<Self, SessionError> {
        url::Url::parse(endpoint)
            .map_err(|e| SessionError::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if session_id.trim().is_empty() {
            return Err(SessionError::Transport("empty session id".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base: endpoint.trim_end_matches('/').to_string(),
            session_id: session_id.trim().to_string(),
            poll_interval: Duration::from_millis(250),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}/{}", self.base, self.session_id, path)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, SessionError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Self::unwrap_value(response).await
    }

    async fn unwrap_value(response: reqwest::Response) -> Result<Value, SessionError> {
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("undecodable response: {}", e)))?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            Ok(value)
        } else {
            Err(error_from_value(&value, status.as_u16()))
        }
    }

    async fn perform(&self, source: Value) -> Result<(), SessionError> {
        self.post("actions", json!({ "actions": [source] }))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                SessionError::Protocol(m) | SessionError::Transport(m) => {
                    SessionError::Interaction(m)
                }
                other => other,
            })
    }
}

/// Maps a WebDriver error object onto [`SessionError`].
fn error_from_value(value: &Value, status: u16) -> SessionError {
    let kind = value.get("error").and_then(Value::as_str).unwrap_or("");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_string();

    match kind {
        "no such element" | "stale element reference" => SessionError::NoSuchElement(message),
        "javascript error" | "script timeout" => SessionError::Script {
            name: "page".to_string(),
            message,
        },
        "element click intercepted" | "element not interactable" | "move target out of bounds" => {
            SessionError::Interaction(message)
        }
        "" => SessionError::Protocol(format!("HTTP {} without error payload", status)),
        other => SessionError::Protocol(format!("{}: {}", other, message)),
    }
}

fn element_refs(value: Value) -> Result<Vec<ElementRef>, SessionError> {
    let Value::Array(items) = value else {
        return Err(SessionError::Protocol("expected an element list".to_string()));
    };
    items
        .iter()
        .map(|item| {
            item.get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| ElementRef(id.to_string()))
                .ok_or_else(|| SessionError::Protocol(format!("not an element reference: {}", item)))
        })
        .collect()
}

fn key_code(key: Key) -> &'static str {
    match key {
        Key::PageDown => "\u{E00F}",
        Key::End => "\u{E010}",
        Key::ArrowDown => "\u{E015}",
    }
}

fn action_source(interaction_kind: &Interaction) -> Option<Value> {
    match interaction_kind {
        Interaction::ScrollBy { dx, dy } => Some(json!({
            "type": "wheel",
            "id": "wheel",
            "actions": [{
                "type": "scroll",
                "x": 0,
                "y": 0,
                "deltaX": dx,
                "deltaY": dy,
                "duration": 0
            }]
        })),
        Interaction::Press(key) => {
            let code = key_code(*key);
            Some(json!({
                "type": "key",
                "id": "keyboard",
                "actions": [
                    { "type": "keyDown", "value": code },
                    { "type": "keyUp", "value": code }
                ]
            }))
        }
        Interaction::Click(_) => None,
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.post("url", json!({ "url": url })).await.map(|_| ())
    }

    async fn query(&self, script: PageScript) -> Result<Value, SessionError> {
        debug!(script = script.name, "Executing page script");
        self.post(
            "execute/sync",
            json!({ "script": script.body, "args": script.args }),
        )
        .await
        .map_err(|e| match e {
            SessionError::Script { message, .. } => SessionError::Script {
                name: script.name.to_string(),
                message,
            },
            other => other,
        })
    }

    async fn find(&self, selector: &str) -> Result<Vec<ElementRef>, SessionError> {
        let value = self
            .post(
                "elements",
                json!({ "using": "css selector", "value": selector }),
            )
            .await?;
        element_refs(value)
    }

    async fn find_within(
        &self,
        parent: &ElementRef,
        selector: &str,
    ) -> Result<Vec<ElementRef>, SessionError> {
        let value = self
            .post(
                &format!("element/{}/elements", parent.0),
                json!({ "using": "css selector", "value": selector }),
            )
            .await?;
        element_refs(value)
    }

    async fn interact(&self, interaction: Interaction) -> Result<(), SessionError> {
        if let Interaction::Click(element) = &interaction {
            return self
                .post(&format!("element/{}/click", element.0), json!({}))
                .await
                .map(|_| ());
        }
        match action_source(&interaction) {
            Some(source) => self.perform(source).await,
            None => Ok(()),
        }
    }

    async fn await_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let wait = async {
            loop {
                match self.query(scripts::ready_state()).await {
                    Ok(Value::String(state)) if state == "complete" => return,
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Ready-state check failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::NotReady(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_validates_endpoint_and_session() {
        assert!(WebDriverSession::attach("not a url", "abc", Duration::from_secs(1)).is_err());
        assert!(WebDriverSession::attach("http://localhost:9515", " ", Duration::from_secs(1)).is_err());

        let session =
            WebDriverSession::attach("http://localhost:9515/", "abc", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            session.endpoint("execute/sync"),
            "http://localhost:9515/session/abc/execute/sync"
        );
    }

    #[test]
    fn test_element_refs_parse_w3c_references() {
        let reference = |id: &str| {
            let mut map = serde_json::Map::new();
            map.insert(ELEMENT_KEY.to_string(), json!(id));
            Value::Object(map)
        };
        let refs = element_refs(json!([reference("e1"), reference("e2")])).unwrap();
        assert_eq!(refs, vec![ElementRef("e1".into()), ElementRef("e2".into())]);

        assert!(element_refs(json!([{ "ELEMENT": "legacy" }])).is_err());
        assert!(element_refs(json!({})).is_err());
    }

    #[test]
    fn test_error_mapping() {
        let err = error_from_value(
            &json!({ "error": "no such element", "message": "gone" }),
            404,
        );
        assert!(matches!(err, SessionError::NoSuchElement(m) if m == "gone"));

        let err = error_from_value(
            &json!({ "error": "element click intercepted", "message": "overlay" }),
            400,
        );
        assert!(matches!(err, SessionError::Interaction(_)));

        let err = error_from_value(&json!(null), 500);
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_key_actions_use_webdriver_codes() {
        let source = action_source(&Interaction::Press(Key::End)).unwrap();
        assert_eq!(source["type"], "key");
        assert_eq!(source["actions"][0]["value"], "\u{E010}");

        let scroll = action_source(&Interaction::ScrollBy { dx: 0, dy: 700 }).unwrap();
        assert_eq!(scroll["actions"][0]["deltaY"], 700);
        assert!(action_source(&Interaction::Click(ElementRef("x".into()))).is_none());
    }
}
