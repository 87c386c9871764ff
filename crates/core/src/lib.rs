//! # Toolmesh Core
//!
//! Domain types, traits, and error definitions for the Toolmesh agent
//! tool-orchestration engine. This crate has **zero framework dependencies**
//! — it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is defined as a trait here (`Callable`,
//! `ModelProvider`). Implementations live in their respective crates. This
//! enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ConnectError, Error, ProviderError, Result, ToolError, WorkflowError};
pub use event::{EventBus, LoopEvent};
pub use message::{Conversation, ConversationId, Message, Role};
pub use provider::{ModelProvider, ModelRequest, ModelResponse, ToolDefinition, Usage};
pub use tool::{Callable, LoopSignal, ToolCall, ToolResult};
