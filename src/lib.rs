//! Behavioral event telemetry for web checkout
//!
//! Records SDK and application events, batches them under a request size
//! ceiling and delivers them to the collector in order, backing off
//! exponentially while it is unreachable. Tracking never blocks and never
//! fails the caller; `dispose` drains what is queued before the tracker goes
//! inert.

pub mod batch;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod flush;
pub mod metrics;
pub mod sdk_events;
pub mod store;
pub mod trace;
pub mod tracker;
pub mod transport;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

// Re-export commonly used types
pub use config::TrackerConfig;
pub use errors::{EventsError, EventsResult};
pub use event::{ExternalEvent, UserIdentity};
pub use sdk_events::{PurchaseMode, SdkEvent};
pub use tracker::EventsTracker;
