//! Tandem Protocol - resumable execution of two-party channel protocols
//!
//! A protocol instance (setup, install, update, uninstall) is an `Action`
//! driven through a pipeline of steps by the `ProtocolEngine`. Progress lives
//! in an `ExecutionCursor` that is journaled to the write-ahead log after
//! every step, so a crashed engine picks each cursor back up from its last
//! recorded step on restart.
//!
//! Steps never touch channel state. The first step stages a transition, the
//! following ones exchange signatures over it, and the engine commits the
//! staged transition to the `ChannelStateStore` once the last step is done,
//! then clears the log entry.

#![forbid(unsafe_code)]

pub mod action;
pub mod client;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod wal;

pub use action::{Action, ExecutionCursor, LogKey, Side};
pub use client::{AppHandle, ChannelClient, ChannelHandle, InstallOptions};
pub use engine::{Completion, DispatchOutcome, EngineEffects, ProtocolEngine};
pub use error::ProtocolError;
pub use middleware::{Step, StepContext, StepOutcome, StepResult};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRegistry};
pub use wal::{LogRecord, WalError, WriteAheadLog};
