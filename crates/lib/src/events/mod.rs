//! Update and log event fan-out.
//!
//! One [`EventBus`] carries upstream updates (tagged by session), another carries
//! log records. The [`EventStreamSupervisor`] keeps upstream handlers attached
//! only while someone is listening.

mod bus;
mod supervisor;

pub use bus::{Callback, EventBus};
pub use supervisor::{EventStreamSupervisor, StreamTicket};
