//! # Esquire Core
//!
//! Domain types, traits, and error definitions for the Esquire legal-assistant
//! runtime. This crate has no storage or network dependencies; it defines the
//! contracts that the other crates implement against.
//!
//! Every collaborator (conversation store, semantic search, model provider,
//! tools) is a trait here, so implementations can be swapped via
//! configuration and replaced by stubs in tests.

pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use memory::{ConversationStore, MemoryRecord, RetentionStore, TurnRole};
pub use message::{ConversationId, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use retrieval::{RetrievalDocument, SearchHit, SearchRequest, SemanticSearch};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
