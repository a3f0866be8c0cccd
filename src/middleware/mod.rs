//! Tower middlewares.
//!
//! Install order matters: [`log::LogRequestsLayer`] only logs panicking
//! requests when [`recovery::RecoveryLayer`] sits inside of it, see the crate
//! docs.

pub mod log;
pub mod recovery;
pub mod trace;
