use serde_json::{Map, Value};

/// Last-seen usage/latency/cost snapshot.
///
/// A snapshot is independent of any single message: it tags the currently
/// building message at view time and backfills the last completed one. The
/// `usage` and `metrics` maps are provider-shaped and kept open.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "timeToFirstToken"
    )]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UsageMetadata {
    /// Merges a later snapshot into this one.
    ///
    /// Time-to-first-token, cost, and the cache token counts fill gaps and
    /// never overwrite a known value. All other top-level fields are
    /// shallow-merged with the newer value winning.
    pub fn backfill(&mut self, latest: &UsageMetadata) {
        if self.time_to_first_token_ms.is_none() {
            self.time_to_first_token_ms = latest.time_to_first_token_ms;
        }
        if self.cost.is_none() {
            self.cost = latest.cost;
        }
        if self.cache_read_input_tokens.is_none() {
            self.cache_read_input_tokens = latest.cache_read_input_tokens;
        }
        if self.cache_creation_input_tokens.is_none() {
            self.cache_creation_input_tokens = latest.cache_creation_input_tokens;
        }

        if latest.usage.is_some() {
            self.usage = latest.usage.clone();
        }
        if latest.metrics.is_some() {
            self.metrics = latest.metrics.clone();
        }
        if latest.trace.is_some() {
            self.trace = latest.trace.clone();
        }
        for (key, value) in &latest.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}
