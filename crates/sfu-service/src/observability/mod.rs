//! Observability for the SFU service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Tokens, emails and negotiation blobs are never logged.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_connections_active` | Gauge | none |
//! | `sfu_rooms_active` | Gauge | none |
//! | `sfu_signaling_messages_total` | Counter | `message_type`, `outcome` |
//! | `sfu_message_latency_seconds` | Histogram | `message_type` |
//! | `sfu_auth_rejections_total` | Counter | `reason` |
//! | `sfu_worker_deaths_total` | Counter | none |
//! | `sfu_producers_total` | Counter | `kind` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_auth_rejection, record_message_latency,
    record_producer_created, record_room_ready_duration, record_signaling_message,
    record_slow_client_dropped, record_worker_death, set_actor_mailbox_depth, set_connections_active, set_rooms_active,
};
