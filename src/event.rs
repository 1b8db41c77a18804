//! Dialog event model.
//!
//! Events cross three boundaries: the caller handing one to `run_action`,
//! the Lua execution environment mutating it, and the remote action-server
//! protocol carrying it as JSON. Wire field names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// An incoming dialog event. Mutated in place by action execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub bot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Conversation partner the event targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub state: EventState,
}

/// Mutable state bags attached to an event. Scripts see `temp`, `user`
/// and `session` both through `event.state` and as top-level aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventState {
    #[serde(default = "empty_object")]
    pub temp: Value,
    #[serde(default = "empty_object")]
    pub user: Value,
    #[serde(default = "empty_object")]
    pub session: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl Default for EventState {
    fn default() -> Self {
        Self {
            temp: empty_object(),
            user: empty_object(),
            session: empty_object(),
        }
    }
}

impl Event {
    pub fn new(bot_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            channel: None,
            target: None,
            payload: empty_object(),
            state: EventState::default(),
        }
    }

    /// Records the HTTP status observed from a remote delegation on
    /// `state.temp.responseStatusCode`.
    pub fn set_response_status_code(&mut self, code: u16) {
        if !self.state.temp.is_object() {
            self.state.temp = empty_object();
        }
        if let Some(map) = self.state.temp.as_object_mut() {
            map.insert("responseStatusCode".to_string(), json!(code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_empty_state_objects() {
        let event = Event::new("bot-1");
        assert_eq!(event.bot_id, "bot-1");
        assert_eq!(event.state.temp, json!({}));
        assert_eq!(event.state.user, json!({}));
        assert_eq!(event.state.session, json!({}));
    }

    #[test]
    fn serializes_with_camel_case_wire_names() {
        let event = Event::new("bot-1");
        let wire = serde_json::to_value(&event).expect("serialize");
        assert!(wire.get("botId").is_some());
        assert!(wire.get("bot_id").is_none());
    }

    #[test]
    fn response_status_code_lands_in_temp() {
        let mut event = Event::new("bot-1");
        event.set_response_status_code(500);
        assert_eq!(event.state.temp["responseStatusCode"], json!(500));
    }

    #[test]
    fn response_status_code_replaces_non_object_temp() {
        let mut event = Event::new("bot-1");
        event.state.temp = json!("corrupted");
        event.set_response_status_code(200);
        assert_eq!(event.state.temp["responseStatusCode"], json!(200));
    }

    #[test]
    fn deserializes_with_missing_state() {
        let event: Event = serde_json::from_value(json!({
            "id": "ev-1",
            "botId": "bot-1",
        }))
        .expect("deserialize");
        assert_eq!(event.state.temp, json!({}));
    }
}
