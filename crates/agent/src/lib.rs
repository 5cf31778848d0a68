//! Turn orchestration for the legal assistant.
//!
//! A turn reads recent conversation memory, runs the model with the
//! `search_law` tool until it answers, stores both sides of the exchange
//! and schedules storage compaction:
//!
//! 1. **Context**: recent turns rendered as a `[MEMORY]` block
//! 2. **Model loop**: tool calls executed and fed back, bounded by `max_iterations`
//! 3. **Persist**: user and assistant turns appended on a detached task
//! 4. **Maintain**: compaction checked in the background

pub mod context;
pub mod turn;

pub use context::{HistoryTurn, build_fallback_input, build_input};
pub use turn::{DEFAULT_INSTRUCTIONS, TurnOutcome, TurnRequest, TurnRunner};
