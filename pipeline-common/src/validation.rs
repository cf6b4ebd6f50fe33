use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::clock::Clock;
use crate::error::ValidationError;
use crate::event::{Priority, RawEvent, ValidatedEvent};

/// Checks raw payloads at admission and turns them into `ValidatedEvent`s.
pub struct Validator {
    priorities: HashMap<String, Priority>,
    skew_tolerance: time::Duration,
    clock: Arc<dyn Clock>,
}

impl Validator {
    pub fn new(
        priorities: HashMap<String, Priority>,
        skew_tolerance: time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            priorities,
            skew_tolerance,
            clock,
        }
    }

    /// Priority an event type is queued at. Unknown types default to medium.
    pub fn priority_for(&self, event_type: &str) -> Priority {
        self.priorities
            .get(event_type)
            .copied()
            .unwrap_or(Priority::Medium)
    }

    pub fn is_known(&self, event_type: &str) -> bool {
        self.priorities.contains_key(event_type)
    }

    /// Validate a payload. Fails if it is not an object or lacks a type, timestamp or
    /// session identifier. Unknown event types and skewed timestamps are only logged.
    pub fn validate(&self, payload: &Value) -> Result<ValidatedEvent, ValidationError> {
        if !payload.is_object() {
            return Err(ValidationError::NotAnObject);
        }

        let raw: RawEvent = serde_json::from_value(payload.clone())
            .map_err(|error| ValidationError::Malformed(error.to_string()))?;

        let event_type = non_empty(raw.event_type).ok_or(ValidationError::MissingField("type"))?;
        let session_id =
            non_empty(raw.session_id).ok_or(ValidationError::MissingField("sessionId"))?;
        let timestamp = match raw.timestamp {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("timestamp")),
            Some(value) => parse_timestamp(&value)?,
        };

        let now = self.clock.now();

        if !self.is_known(&event_type) {
            warn!(event_type = %event_type, "unknown event type, defaulting to medium priority");
        }

        let skew = if timestamp > now {
            timestamp - now
        } else {
            now - timestamp
        };
        let skew = skew.to_std().unwrap_or_default();
        if skew > self.skew_tolerance {
            warn!(
                event_type = %event_type,
                session_id = %session_id,
                skew_secs = skew.as_secs(),
                "event timestamp deviates from wall-clock time"
            );
        }

        Ok(ValidatedEvent {
            processing_id: generate_processing_id(),
            priority: self.priority_for(&event_type),
            event_type,
            timestamp,
            session_id,
            user_id: non_empty(raw.user_id),
            data: raw.data,
            validated_at: now,
        })
    }
}

/// A random 16 hex character token.
pub fn generate_processing_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    let malformed = |reason: &str| ValidationError::MalformedField {
        field: "timestamp",
        reason: reason.to_owned(),
    };

    match value {
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .ok_or_else(|| malformed("expected integer milliseconds"))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| malformed("milliseconds out of range"))
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|error| malformed(&error.to_string())),
        _ => Err(malformed("expected an RFC 3339 string or epoch milliseconds")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::default_event_priorities;
    use serde_json::json;

    fn validator() -> (Validator, ManualClock) {
        let clock = ManualClock::default();
        let validator = Validator::new(
            default_event_priorities(),
            time::Duration::from_secs(300),
            Arc::new(clock.clone()),
        );
        (validator, clock)
    }

    #[test]
    fn test_validate_resolves_priority() {
        let (validator, clock) = validator();
        let now = clock.now();

        let event = validator
            .validate(&json!({
                "type": "booking_complete",
                "sessionId": "s1",
                "timestamp": now.to_rfc3339(),
                "data": {"bookingId": "b-1"}
            }))
            .unwrap();

        assert_eq!(event.priority, Priority::Critical);
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.user_id, None);
        assert_eq!(event.data["bookingId"], "b-1");
        assert_eq!(event.validated_at, now);
        assert_eq!(event.processing_id.len(), 16);
        assert!(event.processing_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_numeric_user_id_and_null_data_are_accepted() {
        let (validator, clock) = validator();

        let event = validator
            .validate(&json!({
                "type": "search",
                "sessionId": "s1",
                "userId": 42,
                "timestamp": clock.now().timestamp_millis(),
                "data": null
            }))
            .unwrap();

        assert_eq!(event.user_id.as_deref(), Some("42"));
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_unknown_type_defaults_to_medium() {
        let (validator, clock) = validator();

        let event = validator
            .validate(&json!({
                "type": "something_new",
                "sessionId": "s1",
                "timestamp": clock.now().timestamp_millis()
            }))
            .unwrap();

        assert_eq!(event.priority, Priority::Medium);
    }

    #[test]
    fn test_skewed_timestamp_is_accepted() {
        let (validator, clock) = validator();
        let an_hour_ago = clock.now() - chrono::Duration::hours(1);

        let event = validator
            .validate(&json!({
                "type": "page_view",
                "sessionId": "s1",
                "timestamp": an_hour_ago.timestamp_millis()
            }))
            .unwrap();

        assert_eq!(event.timestamp.timestamp_millis(), an_hour_ago.timestamp_millis());
    }

    #[test]
    fn test_rejects_non_objects() {
        let (validator, _) = validator();

        assert_eq!(
            validator.validate(&json!(["page_view"])),
            Err(ValidationError::NotAnObject)
        );
        assert_eq!(
            validator.validate(&json!("page_view")),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn test_rejects_missing_fields() {
        let (validator, clock) = validator();
        let now = clock.now().timestamp_millis();

        assert_eq!(
            validator.validate(&json!({"sessionId": "s1", "timestamp": now})),
            Err(ValidationError::MissingField("type"))
        );
        assert_eq!(
            validator.validate(&json!({"type": "page_view", "timestamp": now})),
            Err(ValidationError::MissingField("sessionId"))
        );
        assert_eq!(
            validator.validate(&json!({"type": "page_view", "sessionId": ""})),
            Err(ValidationError::MissingField("sessionId"))
        );
        assert_eq!(
            validator.validate(&json!({"type": "page_view", "sessionId": "s1"})),
            Err(ValidationError::MissingField("timestamp"))
        );
    }

    #[test]
    fn test_rejects_malformed_timestamp() {
        let (validator, _) = validator();

        let result = validator.validate(&json!({
            "type": "page_view",
            "sessionId": "s1",
            "timestamp": "yesterday"
        }));

        assert!(matches!(
            result,
            Err(ValidationError::MalformedField { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_processing_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_processing_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
