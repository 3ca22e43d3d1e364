//! Agent runtime: one run at a time over a shared session, with steering and
//! follow-up queues.

pub mod runtime;

pub use runtime::{Agent, AgentConfig, AgentState, QueueMode};
