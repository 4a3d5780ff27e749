//! parley-ai: interaction model and provider abstraction
//!
//! This crate holds the data a conversation is made of (interactions and the
//! immutable [`Body`] history), the coalescer that turns streamed fragments
//! into stable interactions, and the [`ProviderExecutor`] seam through which
//! the AI backend and tools are reached.

pub mod body;
pub mod error;
pub mod provider;
pub mod stream;
pub mod types;

pub use body::{Body, BodyBuilder, ContextFilter, ContextProvider, ToolFilter};
pub use error::{ProviderError, Result, ToolError, is_context_overflow};
pub use provider::{
    ProviderExecutor, ProviderReply, Request, RequestConfig, RequestKind, ToolRequest, ToolReturn,
};
pub use stream::{DeltaStream, StreamCoalescer, coalesce, coalesce_arguments};
pub use types::*;
