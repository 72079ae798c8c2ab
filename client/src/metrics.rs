//! Client engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "grapnel_client_singular_calls",
    description = "Total singular calls dispatched"
)]
pub static SINGULAR_CALLS: Counter = Counter::new();

#[metric(
    name = "grapnel_client_streams_launched",
    description = "Total server streams launched"
)]
pub static STREAMS_LAUNCHED: Counter = Counter::new();

#[metric(
    name = "grapnel_client_streams_relaunched",
    description = "Total automatic server-stream relaunches"
)]
pub static STREAMS_RELAUNCHED: Counter = Counter::new();

#[metric(
    name = "grapnel_client_streams_rejected",
    description = "Stream launches rejected for duplicate session or type"
)]
pub static STREAMS_REJECTED: Counter = Counter::new();

#[metric(
    name = "grapnel_client_events_dispatched",
    description = "Completion-queue events dispatched onto the strand"
)]
pub static EVENTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "grapnel_client_streams_active",
    description = "Server-stream entries currently supervised"
)]
pub static STREAMS_ACTIVE: Gauge = Gauge::new();
