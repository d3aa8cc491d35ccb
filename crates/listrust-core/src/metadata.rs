//! Per-traversal message metadata
//!
//! A string-keyed JSON map carried next to a message through one pipeline
//! pass and persisted with the queue record when processing is deferred.

use listrust_common::types::ModerationAction;
use listrust_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known metadata keys
pub mod keys {
    pub const LISTID: &str = "listid";
    pub const ISDIGEST: &str = "isdigest";
    pub const RULE_HITS: &str = "rule_hits";
    pub const RULE_MISSES: &str = "rule_misses";
    pub const MODERATION_REASONS: &str = "moderation_reasons";
    pub const MODERATION_ACTION: &str = "moderation_action";
    pub const MODERATION_SENDER: &str = "moderation_sender";
    pub const DMARC: &str = "dmarc";
    pub const DIGEST_PATH: &str = "digest_path";
    pub const VOLUME: &str = "volume";
    pub const DIGEST_NUMBER: &str = "digest_number";
}

/// A reason a message was flagged, rendered later for notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationReason {
    /// Text with `{}` placeholders
    pub template: String,
    pub args: Vec<String>,
}

impl ModerationReason {
    pub fn new(template: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            template: template.into(),
            args,
        }
    }

    /// Substitute arguments into the template, in order
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut args = self.args.iter();
        let mut rest = self.template.as_str();

        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(arg),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageData(Map<String, Value>);

impl MessageData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_list(list_id: &str) -> Self {
        let mut data = Self::new();
        data.insert(keys::LISTID, list_id);
        data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Merge `extras` over the current entries
    pub fn extend(&mut self, extras: Map<String, Value>) {
        self.0.extend(extras);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn list_id(&self) -> Option<&str> {
        self.get_str(keys::LISTID)
    }

    pub fn is_digest(&self) -> bool {
        self.get_bool(keys::ISDIGEST)
    }

    fn push_to_array(&mut self, key: &str, value: Value) {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(value);
        }
    }

    fn string_array(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_rule_hit(&mut self, rule: &str) {
        self.push_to_array(keys::RULE_HITS, Value::from(rule));
    }

    pub fn record_rule_miss(&mut self, rule: &str) {
        self.push_to_array(keys::RULE_MISSES, Value::from(rule));
    }

    pub fn rule_hits(&self) -> Vec<String> {
        self.string_array(keys::RULE_HITS)
    }

    pub fn rule_misses(&self) -> Vec<String> {
        self.string_array(keys::RULE_MISSES)
    }

    pub fn add_moderation_reason(&mut self, reason: ModerationReason) {
        let value = serde_json::to_value(reason).unwrap_or(Value::Null);
        self.push_to_array(keys::MODERATION_REASONS, value);
    }

    pub fn moderation_reasons(&self) -> Vec<ModerationReason> {
        self.0
            .get(keys::MODERATION_REASONS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_moderation_action(&mut self, action: ModerationAction) {
        self.insert(keys::MODERATION_ACTION, action.to_string());
    }

    /// The moderation action a rule asked for, if any
    pub fn moderation_action(&self) -> Result<Option<ModerationAction>> {
        self.get_str(keys::MODERATION_ACTION)
            .map(str::parse::<ModerationAction>)
            .transpose()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for MessageData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
