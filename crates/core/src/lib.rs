//! Concierge Core
//!
//! Side-neutral building blocks of the voice relay: the message `Envelope`
//! both protocol codecs decode into, the shared `ToolRegistry` that executes
//! tool calls, and the side-channel types providers use to reach the caller.

pub mod catalog;
pub mod envelope;
pub mod side_channel;
pub mod tools;

pub use envelope::{
    ControlSignal, Direction, Envelope, EnvelopeKind, SessionConfig, ToolCallRequest,
    ToolCallResult, Transcript, TranscriptRole, TurnDetection,
};
pub use side_channel::{NullNotifier, SideChannelEvent, SideChannelKind, SideChannelNotifier};
pub use tools::{
    InvocationStatus, Tool, ToolContext, ToolError, ToolHandler, ToolInvocation, ToolOutput,
    ToolRegistry, ToolRegistryBuilder, ToolSpec,
};
