//! Error types for northstar-engine.

use thiserror::Error;

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during research-cycle orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Adapter credentials invalid. Terminal; fails cycle start pre-flight.
    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    /// Connection/timeout class error from a provider. Retried per backoff policy.
    #[error("transient provider error ({provider}): {message}")]
    ProviderTransient { provider: String, message: String },

    /// Non-auth 4xx-class error from a provider. Not retried.
    #[error("permanent provider error ({provider}): {message}")]
    ProviderPermanent { provider: String, message: String },

    /// Malformed JSON from a Lead call. Callers should apply the documented
    /// fallback rather than propagate this past the Lead Protocol boundary.
    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// A tool invocation raised or returned the wrong shape.
    #[error("error executing {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    /// A store invariant was violated. Fatal for the operation.
    #[error("store invariant violated: {0}")]
    StoreInvariant(String),

    /// Attempted to start a cycle while one is already running.
    #[error("cycle already running on this workspace: {active_cycle_id}")]
    CycleAlreadyRunning { active_cycle_id: i64 },

    /// Attempted to generate a report while one is already in flight.
    #[error("report generation already in progress")]
    ReportBusy,

    /// Worker hit `max_iterations` or `max_searches` before finishing.
    #[error("budget exceeded: {resource}")]
    BudgetExceeded { resource: String },

    /// SQLite storage error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error talking to an LLM or web provider.
    #[error("http error: {0}")]
    Http(String),

    /// Internal invariant broken (mutex poisoning, unreachable state).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderPermanent {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn store_invariant(message: impl Into<String>) -> Self {
        Self::StoreInvariant(message.into())
    }

    pub fn cycle_already_running(active_cycle_id: i64) -> Self {
        Self::CycleAlreadyRunning { active_cycle_id }
    }

    pub fn budget_exceeded(resource: impl Into<String>) -> Self {
        Self::BudgetExceeded {
            resource: resource.into(),
        }
    }

    /// Whether this error belongs to the connection/timeout retry class
    /// documented in spec §5/§7 (exponential backoff, 2s base, 10s cap,
    /// 3 attempts). Auth and permanent-provider errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. } | Self::Http(_))
    }
}
