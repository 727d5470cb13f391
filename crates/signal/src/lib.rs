pub mod bus;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod topics;

pub use bus::{Inbox, SignalBus, SignalEmitter};
pub use error::SignalError;
pub use metrics::{BusMetrics, SignalMetrics};
pub use signal::{Payload, Signal};
