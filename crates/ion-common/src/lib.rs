use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod logging;

// ============================================================================
// Event Envelope
// ============================================================================

/// The event envelope carried in every queue message body.
///
/// Field names are camelCase on the wire:
/// `{"context":{...},"type":"...","previousStages":[...],"data":[{"key":..,"value":..}]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub context: Option<Context>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub previous_stages: Vec<String>,
    #[serde(default)]
    pub data: Vec<KeyValuePair>,
}

impl Event {
    /// Decode an event from a raw JSON message body
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Context of the event, or an empty one when the envelope carried none
    pub fn context_or_default(&self) -> Context {
        self.context.clone().unwrap_or_default()
    }

    /// Event data as a key/value map. Later duplicates win.
    pub fn data_map(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }
}

/// Identifies where an event sits in the pipeline graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Module name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub parent_event_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}
