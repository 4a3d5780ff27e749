//! parley-agent: conversation session engine
//!
//! This crate drives a conversation against a [`parley_ai::ProviderExecutor`]
//! until it is stable, resolving tool calls, summarizing history when the
//! context window fills up, and reporting progress to observers.

pub mod context;
pub mod error;
pub mod events;
pub mod handle;
pub mod options;
pub mod outcome;
pub mod session;
pub mod tools;
mod turn;
pub mod validation;

pub use context::{ContextConfig, ContextTracker, ContextUsage, SummaryReason};
pub use error::{ErrorKind, SessionError};
pub use events::{ChannelObserver, NoopObserver, Observer, ObserverSet, SessionEvent, TracingObserver};
pub use handle::SessionHandle;
pub use options::{RetryConfig, SessionOptions, StreamingOptions};
pub use outcome::{Return, Stage};
pub use session::{DEFAULT_GREETING_TIMEOUT, Session};
