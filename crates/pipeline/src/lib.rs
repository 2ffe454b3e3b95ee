//! Command pipeline
//!
//! The scheduling core: accepts command requests, orders them in a
//! bounded four-band priority queue, and drains them with a fixed worker
//! pool through the dispatch stages (classify, attach context, route,
//! invoke, respond). Deadlines and cancellation are checked at every
//! stage boundary; per-session FIFO is enforced by a sequence gate.

pub mod gate;
pub mod pipeline;
pub mod queue;
pub mod retry;

pub use gate::SessionGate;
pub use pipeline::CommandPipeline;
pub use queue::{CommandQueue, SubmitOutcome};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is shutting down")]
    ShuttingDown,
}
