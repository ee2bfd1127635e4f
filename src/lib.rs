#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod build;
pub mod error;
pub mod events;
pub mod fs;
pub mod node;
pub mod queue;
pub mod report;
pub mod session;
pub mod transform;

pub use crate::build::{BuildOptions, BuildTask, Flatten, build};
pub use crate::error::{Cause, ErrorCode, GobbleError, SourceLocation};
pub use crate::events::{Event, EventKind, Info, InfoCode, ListenerId};
pub use crate::node::{CycleState, Node};
pub use crate::queue::ExecutionQueue;
pub use crate::session::{Environment, Mode, Session, SessionConfig};
pub use crate::transform::{
    Completion, LegacyArgs, Options, TransformArgs, TransformContext, TransformFuture, Transformer,
};
