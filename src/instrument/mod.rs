//! Live instrument control plane
//!
//! Everything needed to manage breakpoints and log points on remote
//! agents: the data model, the remote command protocol, the lifecycle
//! registry, apply-wait tracking, TTL expiry, and the breakpoint-hit
//! capture transformer.

pub mod command;
pub mod event;
pub mod expiry;
pub mod model;
pub mod registry;
pub mod transform;
pub mod waiting;

pub use command::{CommandDispatcher, CommandType, InstrumentCommand};
pub use event::{
    BreakpointHit, BreakpointRemoved, LiveInstrumentEvent, LiveInstrumentEventType, LogHit,
    LogRemoved,
};
pub use expiry::{ExpirySweeper, SweeperHandle};
pub use model::{DeveloperInstrument, InstrumentDetail, InstrumentKind, LiveInstrument, SourceLocation};
pub use registry::LiveInstrumentRegistry;
pub use transform::{StackFrame, StackTrace, Variable, VariableScope, VariableValue};
