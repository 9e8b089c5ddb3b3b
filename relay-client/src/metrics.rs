//! Relay metrics.
//!
//! Metrics are emitted through the `metrics` facade. Installing a recorder is left to the
//! embedding application; with no recorder installed they are no-ops.

pub const METRIC_PUBLISHED: &str = "relay_messages_published";
pub const METRIC_PUBLISH_FAILURES: &str = "relay_publish_failures";
pub const METRIC_PUBLISH_DUPLICATES: &str = "relay_publish_duplicates";
pub const METRIC_FETCHED: &str = "relay_messages_fetched";
pub const METRIC_FETCH_ERRORS: &str = "relay_fetch_errors";
pub const METRIC_ACKED: &str = "relay_messages_acked";
pub const METRIC_NACKED: &str = "relay_messages_nacked";
pub const METRIC_ACK_FAILURES: &str = "relay_ack_failures";
pub const METRIC_DECODE_FAILURES: &str = "relay_decode_failures";
pub const METRIC_DISPATCH_OCCUPANCY: &str = "relay_dispatch_occupancy";

/// Register all Relay metrics with the installed recorder.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_PUBLISHED, metrics::Unit::Count, "messages accepted by the log service");
    metrics::register_counter!(METRIC_PUBLISH_FAILURES, metrics::Unit::Count, "publication attempts which failed");
    metrics::register_counter!(METRIC_PUBLISH_DUPLICATES, metrics::Unit::Count, "publications suppressed as duplicates by the log service");
    metrics::register_counter!(METRIC_FETCHED, metrics::Unit::Count, "deliveries received from pull fetches");
    metrics::register_counter!(METRIC_FETCH_ERRORS, metrics::Unit::Count, "pull fetches which failed with a transport error");
    metrics::register_counter!(METRIC_ACKED, metrics::Unit::Count, "deliveries acknowledged by workers");
    metrics::register_counter!(METRIC_NACKED, metrics::Unit::Count, "deliveries negatively acknowledged by workers");
    metrics::register_counter!(METRIC_ACK_FAILURES, metrics::Unit::Count, "acks or naks which could not be delivered");
    metrics::register_counter!(METRIC_DECODE_FAILURES, metrics::Unit::Count, "delivered payloads which were not valid messages");
    metrics::register_gauge!(METRIC_DISPATCH_OCCUPANCY, metrics::Unit::Count, "deliveries queued for or held by workers");
}
