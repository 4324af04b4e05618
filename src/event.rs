//! Event model and wire payload
//!
//! An [`Event`] is fixed at construction: id, timestamp, name, properties,
//! context snapshot and trace placement never change afterwards. The user it
//! is attributed to is not part of the event; it is supplied when the event is
//! encoded for sending, so identity changes made while the event sits in the
//! queue are reflected on the wire.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::batch::EncodedEvent;
use crate::context::EventContext;
use crate::errors::{EventsError, EventsResult};

/// `type` field of every payload
pub const EVENT_TYPE: &str = "web_billing";

/// `fooBarBaz` -> `foo_bar_baz`; keys already in snake_case are unchanged
pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Normalize top-level keys to snake_case; nested values are left untouched
pub fn normalize_keys(properties: Map<String, Value>) -> Map<String, Value> {
    properties
        .into_iter()
        .map(|(key, value)| (to_snake_case(&key), value))
        .collect()
}

/// User an event is attributed to when it is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub app_user_id: String,
    pub is_anonymous: bool,
}

impl UserIdentity {
    pub fn new(app_user_id: impl Into<String>, is_anonymous: bool) -> Self {
        Self {
            app_user_id: app_user_id.into(),
            is_anonymous,
        }
    }
}

/// Event reported by the embedding application with an open property map
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEvent {
    pub event_name: String,
    pub properties: Map<String, Value>,
    /// Reported as the context `source`
    pub source: String,
}

impl ExternalEvent {
    pub fn new(event_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            properties: Map::new(),
            source: source.into(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Reject names and keys the collector cannot index
    pub fn validate(&self) -> EventsResult<()> {
        if self.event_name.trim().is_empty() {
            return Err(EventsError::InvalidProperty {
                key: "event_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let mut normalized = HashSet::with_capacity(self.properties.len());
        for (key, value) in &self.properties {
            if key.trim().is_empty() {
                return Err(EventsError::InvalidProperty {
                    key: key.clone(),
                    reason: "property keys must not be empty".to_string(),
                });
            }
            if contains_object(value) {
                return Err(EventsError::InvalidProperty {
                    key: key.clone(),
                    reason: "values must be scalars, null or arrays of those".to_string(),
                });
            }
            if !normalized.insert(to_snake_case(key)) {
                return Err(EventsError::InvalidProperty {
                    key: key.clone(),
                    reason: format!("collides with another key as {}", to_snake_case(key)),
                });
            }
        }

        Ok(())
    }
}

fn contains_object(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(contains_object),
        _ => false,
    }
}

/// Everything needed to construct an [`Event`]
#[derive(Debug, Clone)]
pub struct EventData {
    pub event_name: String,
    pub properties: Map<String, Value>,
    pub context: EventContext,
    pub trace_id: String,
    pub trace_index: u64,
    pub checkout_session_id: Option<String>,
    pub workflow_identifier: Option<String>,
}

/// Immutable tracked event
#[derive(Debug, Clone)]
pub struct Event {
    id: Uuid,
    timestamp_ms: i64,
    data: EventData,
}

#[derive(Serialize)]
struct EventPayload<'a> {
    id: Uuid,
    timestamp_ms: i64,
    #[serde(rename = "type")]
    event_type: &'static str,
    event_name: &'a str,
    app_user_id: &'a str,
    context: &'a EventContext,
    properties: Map<String, Value>,
}

impl Event {
    /// Stamp a new event with a fresh id and `timestamp_ms`
    pub fn new(mut data: EventData, timestamp_ms: i64) -> Self {
        data.properties = normalize_keys(std::mem::take(&mut data.properties));
        Self {
            id: Uuid::new_v4(),
            timestamp_ms,
            data,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn event_name(&self) -> &str {
        &self.data.event_name
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.data.properties
    }

    pub fn context(&self) -> &EventContext {
        &self.data.context
    }

    pub fn trace_id(&self) -> &str {
        &self.data.trace_id
    }

    pub fn checkout_session_id(&self) -> Option<&str> {
        self.data.checkout_session_id.as_deref()
    }

    /// Wire payload attributed to `user`
    pub fn to_payload(&self, user: &UserIdentity) -> Value {
        serde_json::to_value(self.payload(user)).unwrap_or(Value::Null)
    }

    /// Wire JSON attributed to `user`
    pub fn encode(&self, user: &UserIdentity) -> EventsResult<EncodedEvent> {
        let json = serde_json::to_string(&self.payload(user))?;
        Ok(EncodedEvent {
            id: self.id,
            event_name: self.data.event_name.clone(),
            json,
        })
    }

    fn payload<'a>(&'a self, user: &'a UserIdentity) -> EventPayload<'a> {
        let mut properties = self.data.properties.clone();
        properties.insert(
            "trace_id".to_string(),
            Value::String(self.data.trace_id.clone()),
        );
        properties.insert(
            "trace_index".to_string(),
            Value::from(self.data.trace_index),
        );
        properties.insert(
            "checkout_session_id".to_string(),
            self.data
                .checkout_session_id
                .clone()
                .map_or(Value::Null, Value::String),
        );
        if let Some(workflow) = &self.data.workflow_identifier {
            properties.insert(
                "workflow_identifier".to_string(),
                Value::String(workflow.clone()),
            );
        }
        properties.insert(
            "user_is_anonymous".to_string(),
            Value::Bool(user.is_anonymous),
        );

        EventPayload {
            id: self.id,
            timestamp_ms: self.timestamp_ms,
            event_type: EVENT_TYPE,
            event_name: &self.data.event_name,
            app_user_id: &user.app_user_id,
            context: &self.data.context,
            properties,
        }
    }
}
