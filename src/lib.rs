//! Child-process supervision: launch a helper executable, route its output
//! by logging verbosity, poll liveness on demand, and stop it with a
//! graceful-then-forceful escalation bounded at five seconds.

pub mod config;
pub mod output;
pub mod signals;
pub mod supervisor;

pub use output::OutputMode;
pub use supervisor::{StartError, Supervisor, ESCALATION_TIMEOUT};
