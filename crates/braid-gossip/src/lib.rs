//! # braid-gossip
//! Message admission pipeline for Braid: validator chain, work unit cache,
//! ancestor request queue, and the message processor tying them together.

pub mod config;
pub mod metrics;
pub mod processor;
pub mod request_queue;
pub mod validation;
pub mod work_unit;

pub use config::GossipConfig;
pub use metrics::{GossipMetrics, MetricsSnapshot};
pub use processor::{MessageProcessor, ProcessorEvent};
pub use request_queue::{PendingRequest, RequestQueue, TickOutcome};
pub use validation::ValidatorChain;
pub use work_unit::{Verdict, WorkUnit, WorkUnitCache};
