use serde_json::Value;

use crate::core::chain::ToolCall;

/// Argument fields that change between otherwise identical calls.
const VOLATILE_FIELDS: &[&str] = &["message"];

/// Tracks the last run of identical tool calls within one chain execution.
#[derive(Debug)]
pub struct RepeatingDetector {
    threshold: usize,
    last: Option<(String, String)>,
    count: usize,
}

impl RepeatingDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            last: None,
            count: 0,
        }
    }

    /// Records the call and reports whether it extends a run that reached the threshold.
    pub fn detect(&mut self, call: &ToolCall) -> bool {
        let key = (call.name.clone(), normalize_arguments(&call.arguments));
        if self.last.as_ref() != Some(&key) {
            self.last = Some(key);
            self.count = 1;
            return false;
        }
        self.count += 1;
        self.count >= self.threshold
    }
}

/// Drops volatile fields and sorts keys. Non-object arguments compare verbatim.
fn normalize_arguments(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mut map)) => {
            for field in VOLATILE_FIELDS {
                map.remove(*field);
            }
            let sorted: std::collections::BTreeMap<_, _> = map.into_iter().collect();
            serde_json::to_string(&sorted).unwrap_or_else(|_| raw.trim().to_string())
        }
        _ => raw.trim().to_string(),
    }
}
