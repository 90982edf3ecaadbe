//! Event payload predicates
//!
//! A predicate refines an event trigger beyond its type: the trigger only
//! counts events whose payload satisfies the predicate. Predicates are part
//! of the schedule document and evaluate purely in memory.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative filter over an event payload.
///
/// Missing payloads are evaluated as JSON null, so a predicate can
/// explicitly match "event with no data" via `Matches(null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPredicate {
    /// All sub-predicates must match
    And(Vec<EventPredicate>),

    /// At least one sub-predicate must match
    Or(Vec<EventPredicate>),

    /// Inverts the inner predicate
    Not(Box<EventPredicate>),

    /// Structural subset match against the payload
    Matches(Value),

    /// A single payload key equals the given value
    KeyEquals { key: String, value: Value },
}

impl EventPredicate {
    pub fn apply(&self, payload: &Value) -> bool {
        match self {
            Self::And(predicates) => predicates.iter().all(|p| p.apply(payload)),
            Self::Or(predicates) => predicates.iter().any(|p| p.apply(payload)),
            Self::Not(predicate) => !predicate.apply(payload),
            Self::Matches(expected) => json_matches(expected, payload),
            Self::KeyEquals { key, value } => payload.get(key) == Some(value),
        }
    }

    pub fn matches(expected: Value) -> Self {
        Self::Matches(expected)
    }

    pub fn key_equals(key: impl Into<String>, value: Value) -> Self {
        Self::KeyEquals {
            key: key.into(),
            value,
        }
    }

    pub fn not(predicate: EventPredicate) -> Self {
        Self::Not(Box::new(predicate))
    }
}

/// Subset comparison: objects match when every expected key matches
/// recursively, everything else requires equality.
fn json_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected_map), Value::Object(actual_map)) => {
            expected_map.iter().all(|(key, expected_value)| {
                actual_map
                    .get(key)
                    .is_some_and(|actual_value| json_matches(expected_value, actual_value))
            })
        }
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_subset() {
        let predicate = EventPredicate::matches(json!({"screen": "home"}));

        assert!(predicate.apply(&json!({"screen": "home", "count": 3})));
        assert!(!predicate.apply(&json!({"screen": "settings"})));
        assert!(!predicate.apply(&json!({})));
        assert!(!predicate.apply(&Value::Null));
    }

    #[test]
    fn test_matches_nested() {
        let predicate = EventPredicate::matches(json!({"properties": {"sku": "a-100"}}));

        assert!(predicate.apply(&json!({
            "properties": {"sku": "a-100", "qty": 2},
            "name": "purchase"
        })));
        assert!(!predicate.apply(&json!({"properties": {"sku": "b-200"}})));
    }

    #[test]
    fn test_matches_null_payload() {
        let predicate = EventPredicate::matches(Value::Null);
        assert!(predicate.apply(&Value::Null));
        assert!(!predicate.apply(&json!({})));
    }

    #[test]
    fn test_key_equals() {
        let predicate = EventPredicate::key_equals("name", json!("purchase"));

        assert!(predicate.apply(&json!({"name": "purchase"})));
        assert!(!predicate.apply(&json!({"name": "refund"})));
        assert!(!predicate.apply(&Value::Null));
    }

    #[test]
    fn test_combinators() {
        let predicate = EventPredicate::And(vec![
            EventPredicate::key_equals("name", json!("purchase")),
            EventPredicate::not(EventPredicate::key_equals("test", json!(true))),
        ]);

        assert!(predicate.apply(&json!({"name": "purchase"})));
        assert!(!predicate.apply(&json!({"name": "purchase", "test": true})));

        let either = EventPredicate::Or(vec![
            EventPredicate::key_equals("name", json!("purchase")),
            EventPredicate::key_equals("name", json!("refund")),
        ]);
        assert!(either.apply(&json!({"name": "refund"})));
        assert!(!either.apply(&json!({"name": "view"})));
    }

    #[test]
    fn test_document_round_trip() {
        let predicate = EventPredicate::Or(vec![
            EventPredicate::matches(json!({"screen": "home"})),
            EventPredicate::key_equals("version", json!("2.0.0")),
        ]);

        let value = serde_json::to_value(&predicate).unwrap();
        assert_eq!(
            value,
            json!({"or": [
                {"matches": {"screen": "home"}},
                {"key_equals": {"key": "version", "value": "2.0.0"}}
            ]})
        );

        let parsed: EventPredicate = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, predicate);
    }
}
