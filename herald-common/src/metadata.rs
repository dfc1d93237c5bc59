use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known metadata keys.
pub mod keys {
    pub const LISTNAME: &str = "listname";
    pub const RECIPS: &str = "recips";
    pub const PIPELINE: &str = "pipeline";
    pub const LAST_RECIP_COUNT: &str = "last_recip_count";
    pub const DELIVER_UNTIL: &str = "deliver_until";
    pub const ISDIGEST: &str = "isdigest";
    pub const FASTTRACK: &str = "_fasttrack";
    pub const APPROVED: &str = "approved";
    pub const LANG: &str = "lang";
    pub const ENVSENDER: &str = "envsender";
    pub const RECEIVED_TIME: &str = "received_time";
    pub const ORIGINAL_SENDER: &str = "original_sender";
    pub const VERP: &str = "verp";
}

/// Routing and bookkeeping data that travels alongside a queued message.
///
/// This is an open mapping: keys the runners do not know about are carried
/// through every dequeue/requeue untouched. The typed accessors below cover
/// the keys the runners themselves read and write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, used when enqueueing a copy with overrides
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.to_string(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Loose truthiness, as flags are set by many different handlers:
    /// `true`, non-zero numbers and non-empty strings/arrays all count.
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.0.get(key).and_then(Value::as_array).map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    pub fn listname(&self) -> Option<&str> {
        self.get_str(keys::LISTNAME).filter(|name| !name.is_empty())
    }

    pub fn set_listname(&mut self, listname: &str) {
        self.insert(keys::LISTNAME, listname);
    }

    pub fn recips(&self) -> Option<Vec<String>> {
        self.string_list(keys::RECIPS)
    }

    pub fn set_recips<S: Into<String>>(&mut self, recips: impl IntoIterator<Item = S>) {
        let recips: Vec<Value> = recips.into_iter().map(|r| Value::String(r.into())).collect();
        self.insert(keys::RECIPS, recips);
    }

    /// The remaining pipeline stages stored by a previous, failed run
    pub fn pipeline(&self) -> Option<VecDeque<String>> {
        self.string_list(keys::PIPELINE).map(VecDeque::from)
    }

    pub fn set_pipeline(&mut self, stages: &VecDeque<String>) {
        let stages: Vec<Value> = stages.iter().cloned().map(Value::String).collect();
        self.insert(keys::PIPELINE, stages);
    }

    /// Size of the temporary-failure set on the previous delivery attempt
    pub fn last_recip_count(&self) -> usize {
        self.0
            .get(keys::LAST_RECIP_COUNT)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    pub fn set_last_recip_count(&mut self, count: usize) {
        self.insert(keys::LAST_RECIP_COUNT, count);
    }

    /// Delivery deadline, in seconds since the Unix epoch
    pub fn deliver_until(&self) -> Option<f64> {
        self.0.get(keys::DELIVER_UNTIL).and_then(Value::as_f64)
    }

    pub fn set_deliver_until(&mut self, deadline: f64) {
        self.insert(keys::DELIVER_UNTIL, deadline);
    }

    pub fn is_digest(&self) -> bool {
        self.flag(keys::ISDIGEST)
    }

    pub fn is_fasttrack(&self) -> bool {
        self.flag(keys::FASTTRACK)
    }

    pub fn is_approved(&self) -> bool {
        self.flag(keys::APPROVED)
    }

    pub fn lang(&self) -> Option<&str> {
        self.get_str(keys::LANG)
    }

    pub fn set_lang(&mut self, lang: &str) {
        self.insert(keys::LANG, lang);
    }

    pub fn envsender(&self) -> Option<&str> {
        self.get_str(keys::ENVSENDER)
    }

    pub fn set_envsender(&mut self, sender: &str) {
        self.insert(keys::ENVSENDER, sender);
    }

    /// When the message first entered the system, in seconds since the epoch
    pub fn received_time(&self) -> Option<f64> {
        self.0.get(keys::RECEIVED_TIME).and_then(Value::as_f64)
    }

    pub fn set_received_time(&mut self, when: f64) {
        self.insert(keys::RECEIVED_TIME, when);
    }

    pub fn original_sender(&self) -> Option<&str> {
        self.get_str(keys::ORIGINAL_SENDER)
    }

    pub fn set_original_sender(&mut self, sender: &str) {
        self.insert(keys::ORIGINAL_SENDER, sender);
    }

    pub fn verp(&self) -> bool {
        self.flag(keys::VERP)
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
