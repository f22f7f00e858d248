//! ballast-coordinator — process-level leadership and the scheduling loop.
//!
//! # Architecture
//!
//! ```text
//! Store ◀──Elector/watch─── LeadershipDriver ──Arc<Runtime>──▶ ScheduleLoop
//!   ▲                             │                              │
//!   └──────load (on win/refresh)──┘                  schedulers ─┴─▶ OperatorSink
//! ```
//!
//! The driver decides whether this process leads and owns the runtime
//! snapshot; the loop only schedules while the driver reports leadership.

pub mod leadership;
pub mod schedule_loop;

pub use leadership::{DriverOptions, LeadershipDriver};
pub use schedule_loop::{LoggingSink, OperatorSink, ScheduleLoop};
