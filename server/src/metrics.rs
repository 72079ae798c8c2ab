//! Service engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "grapnel_server_calls_accepted",
    description = "Total inbound RPCs accepted across all methods"
)]
pub static CALLS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "grapnel_server_responses_sent",
    description = "Total unary responses (or error statuses) written"
)]
pub static RESPONSES_SENT: Counter = Counter::new();

#[metric(
    name = "grapnel_server_notifications_written",
    description = "Total stream notifications written to the wire"
)]
pub static NOTIFICATIONS_WRITTEN: Counter = Counter::new();

#[metric(
    name = "grapnel_server_streams_cancelled",
    description = "Total server streams cancelled by the peer"
)]
pub static STREAMS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "grapnel_server_events_dispatched",
    description = "Total completion-queue events dispatched by workers"
)]
pub static EVENTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "grapnel_server_contexts_active",
    description = "Method contexts currently alive"
)]
pub static CONTEXTS_ACTIVE: Gauge = Gauge::new();
