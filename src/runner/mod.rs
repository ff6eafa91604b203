//! One-shot sandboxed job execution.
//!
//! A [`Job`] pairs a task with an input and runs it inside an external
//! sandbox process under hard wall-clock and output limits. The sandbox gets
//! its own process group and is killed as a group, so no stragglers survive
//! a timeout, an overflow or an abort.

mod job;

pub use job::{Job, JobHandle};
