//! Session and streaming options

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options recognised by [`Session::run_to_stable_result`](crate::Session::run_to_stable_result)
/// and [`Session::stream`](crate::Session::stream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Execute pending tool calls automatically
    pub process_tools: bool,
    /// Provider-call budget, counted in turns
    pub max_turns: u32,
    /// Follow-up calls allowed per turn to consume tool results; does not use turns.
    ///
    /// Tools run once more after the last follow-up, so a turn can execute
    /// `max_tool_passes + 1` passes. Results of that final pass reach the
    /// provider in the next turn, or never when `max_turns` is spent.
    pub max_tool_passes: u32,
    /// Execute the calls of one pass concurrently
    pub allow_parallel_tools: bool,
    /// Backoff for transient provider errors
    pub retry: RetryConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            process_tools: true,
            max_turns: 8,
            max_tool_passes: 4,
            allow_parallel_tools: false,
            retry: RetryConfig::default(),
        }
    }
}

/// Options that only apply to streaming runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingOptions {
    /// Surface every provider delta as a stream element
    pub emit_deltas: bool,
    /// Surface reasoning-only deltas
    pub emit_reasoning: bool,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            emit_deltas: true,
            emit_reasoning: true,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}
