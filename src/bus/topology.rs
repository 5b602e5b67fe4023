//! Header and argument tables for publishing and topology declaration.

use super::connection::MessageProperties;
use super::event::{EventMetadata, ExchangeKind, FieldTable, FieldValue};

/// Delay (milliseconds) read by the delayed-message exchange.
pub const X_DELAY: &str = "x-delay";
/// Routing algorithm a delayed exchange applies after the delay.
pub const X_DELAYED_TYPE: &str = "x-delayed-type";
/// Default for [`X_DELAYED_TYPE`].
pub const DEFAULT_DELAYED_TYPE: &str = "direct";
pub const X_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const X_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Static headers of the event type overlaid with the instance's own.
pub fn merge_headers(static_headers: &FieldTable, instance_headers: FieldTable) -> FieldTable {
    let mut headers = static_headers.clone();
    headers.extend(instance_headers);
    headers
}

/// Set `x-delay`. A zero `ttl` keeps a delay already present in the headers.
pub fn apply_delay(headers: &mut FieldTable, ttl: u32) {
    if ttl == 0 && headers.contains_key(X_DELAY) {
        return;
    }
    headers.insert(X_DELAY.to_string(), FieldValue::from(ttl));
}

/// Exchange arguments with `x-delayed-type` defaulted to `direct`.
pub fn delayed_exchange_args(arguments: &FieldTable) -> FieldTable {
    let mut arguments = arguments.clone();
    arguments
        .entry(X_DELAYED_TYPE.to_string())
        .or_insert_with(|| FieldValue::from(DEFAULT_DELAYED_TYPE));
    arguments
}

/// Arguments for declaring the event's exchange.
pub fn exchange_args(metadata: &EventMetadata) -> FieldTable {
    match metadata.exchange.kind {
        ExchangeKind::Delayed => delayed_exchange_args(&metadata.exchange_args),
        _ => metadata.exchange_args.clone(),
    }
}

/// Arguments for declaring the event's queue, including dead-letter routing
/// when enabled.
pub fn queue_args(metadata: &EventMetadata) -> FieldTable {
    let mut arguments = metadata.queue_args.clone();
    if metadata.exchange.dead_letter {
        arguments.insert(
            X_DEAD_LETTER_EXCHANGE.to_string(),
            FieldValue::from(metadata.exchange.dead_letter_exchange()),
        );
        arguments.insert(
            X_DEAD_LETTER_ROUTING_KEY.to_string(),
            FieldValue::from(metadata.exchange.dead_letter_queue()),
        );
    }
    arguments
}

/// Persistent properties with priority and optional headers.
pub fn publish_properties(
    priority: u8,
    headers: FieldTable,
    message_id: String,
    content_type: &str,
) -> MessageProperties {
    MessageProperties {
        headers: (!headers.is_empty()).then_some(headers),
        message_id: Some(message_id),
        content_type: Some(content_type.to_string()),
        ..MessageProperties::persistent(priority)
    }
}
