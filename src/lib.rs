//! strand: resumable, branchable agent sessions.
//!
//! Drives turns of "model responds, optionally calls tools, tools execute,
//! results feed back" against a [`provider::ModelClient`], with steering and
//! follow-up injection, cooperative cancellation, and history compaction over
//! an append-only session tree persisted as JSONL.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::prelude::*;
//!
//! # async fn example(client: Arc<dyn ModelClient>) -> strand::error::Result<()> {
//! let session = strand::session::shared(SessionTree::in_memory());
//! let agent = Agent::new(client, session, AgentConfig::default());
//! let outcome = agent.prompt("Hello!").await?;
//! println!("{:?}", outcome.state);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod agent_loop;
pub mod channel;
pub mod compaction;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod session;
pub mod tools;
pub mod types;
pub mod util;
