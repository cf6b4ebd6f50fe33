//! Event-type-specific work done by the core-processing stage.
//!
//! Handlers are looked up by event type in a `HandlerRegistry`; types without a registered
//! handler go through a pass-through handler. Supporting a new event type means registering a
//! handler, not touching the executor.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::error::StageError;
use crate::event::ValidatedEvent;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Extracts the sub-records that matter for one kind of event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError>;
}

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    fallback: Arc<dyn EventHandler>,
}

impl HandlerRegistry {
    /// An empty registry: every event type goes through the pass-through handler.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(PassthroughHandler),
        }
    }

    /// A registry with handlers for the page, booking, user and error event families.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let page: Arc<dyn EventHandler> = Arc::new(PageHandler);
        for event_type in ["page_view", "click", "scroll"] {
            registry.register(event_type, page.clone());
        }

        let booking: Arc<dyn EventHandler> = Arc::new(BookingHandler);
        for event_type in [
            "booking_start",
            "booking_complete",
            "payment_complete",
            "payment_failed",
        ] {
            registry.register(event_type, booking.clone());
        }

        let user: Arc<dyn EventHandler> = Arc::new(UserHandler);
        for event_type in ["user_registration", "user_login"] {
            registry.register(event_type, user.clone());
        }

        let error: Arc<dyn EventHandler> = Arc::new(ErrorHandler);
        for event_type in ["error", "system_error"] {
            registry.register(event_type, error.clone());
        }

        registry
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        drop(self.handlers.insert(event_type.into(), handler));
    }

    pub fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, StageError> {
        self.handlers
            .get(&event.event_type)
            .unwrap_or(&self.fallback)
            .handle(event)
            .map_err(|HandlerError(reason)| StageError::CoreProcessing {
                event_type: event.event_type.clone(),
                reason,
            })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Copy `field` out of the event data if present, requiring it to pass `check`.
fn optional_field(
    data: &Map<String, Value>,
    field: &str,
    expected: &str,
    check: fn(&Value) -> bool,
) -> Result<Value, HandlerError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(value) if check(value) => Ok(value.clone()),
        Some(value) => Err(HandlerError(format!(
            "field {field} must be {expected}, got {value}"
        ))),
    }
}

fn optional_string(data: &Map<String, Value>, field: &str) -> Result<Value, HandlerError> {
    optional_field(data, field, "a string", Value::is_string)
}

fn optional_number(data: &Map<String, Value>, field: &str) -> Result<Value, HandlerError> {
    optional_field(data, field, "a number", Value::is_number)
}

fn details(key: &str, record: Value) -> Map<String, Value> {
    let mut details = Map::new();
    drop(details.insert(key.to_owned(), record));
    details
}

pub struct PassthroughHandler;

impl EventHandler for PassthroughHandler {
    fn handle(&self, _event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError> {
        Ok(Map::new())
    }
}

/// Page views and on-page interactions.
pub struct PageHandler;

impl EventHandler for PageHandler {
    fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError> {
        let data = &event.data;
        Ok(details(
            "page",
            json!({
                "url": optional_string(data, "url")?,
                "title": optional_string(data, "title")?,
                "referrer": optional_string(data, "referrer")?,
                "element": optional_string(data, "element")?,
            }),
        ))
    }
}

pub struct BookingHandler;

impl EventHandler for BookingHandler {
    fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError> {
        let data = &event.data;
        let amount = optional_number(data, "amount")?;
        if amount.as_f64().is_some_and(|amount| amount < 0.0) {
            return Err(HandlerError(format!("amount must not be negative, got {amount}")));
        }

        Ok(details(
            "booking",
            json!({
                "bookingId": optional_string(data, "bookingId")?,
                "amount": amount,
                "currency": optional_string(data, "currency")?,
                "stage": event.event_type,
            }),
        ))
    }
}

pub struct UserHandler;

impl EventHandler for UserHandler {
    fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError> {
        let data = &event.data;
        Ok(details(
            "user",
            json!({
                "userId": event.user_id,
                "method": optional_string(data, "method")?,
                "plan": optional_string(data, "plan")?,
            }),
        ))
    }
}

pub struct ErrorHandler;

impl EventHandler for ErrorHandler {
    fn handle(&self, event: &ValidatedEvent) -> Result<Map<String, Value>, HandlerError> {
        let data = &event.data;
        let severity = match optional_string(data, "severity")? {
            Value::Null => Value::from("error"),
            severity => severity,
        };

        Ok(details(
            "error",
            json!({
                "message": optional_string(data, "message")?,
                "code": data.get("code").cloned().unwrap_or(Value::Null),
                "severity": severity,
            }),
        ))
    }
}
