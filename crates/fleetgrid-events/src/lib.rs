//! fleetgrid-events — change propagation for FleetGrid.
//!
//! Every persistence write fires a fine-grained [`EntityEvent`] onto the
//! in-process [`EventBus`]. The [`ChangeCoalescer`] listens to those events,
//! remembers which rollouts and rollout groups were touched, and on a fixed
//! period publishes one [`ChangeNotification`] per touched key. Consumers
//! re-query counts when a notification arrives instead of reacting to every
//! device report.

pub mod bus;
pub mod coalescer;
pub mod error;
pub mod event;

pub use bus::{EventBus, NotificationSink};
pub use coalescer::{ChangeCoalescer, FlushReport};
pub use error::{EventError, EventResult};
pub use event::{ChangeNotification, EntityEvent};
