//! Engine configuration: mission text, API-key env var names, search
//! provider priority, graph thresholds, storage path, and retry/timeout
//! policy (SPEC_FULL.md §A.3). The concrete TOML-file loader is out of
//! scope (spec §1 Non-goals) — this is a programmatic builder in the
//! teacher's `ClientConfig` idiom, constructed directly or from
//! already-parsed values.

use std::path::PathBuf;
use std::time::Duration;

/// Retry backoff policy: exponential between `min`/`max`, capped at
/// `max_attempts`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { min_backoff: Duration::from_secs(2), max_backoff: Duration::from_secs(10), max_attempts: 3 }
    }
}

/// Engine-wide configuration. Defaults match the documented thresholds:
/// merge similarity 0.75, dedup similarity 0.85, confidence discount 0.7,
/// consensus boost 0.15, request timeout 30s, retry backoff 2s-10s over
/// 3 attempts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_id: String,
    pub mission: String,
    pub storage_path: Option<PathBuf>,
    /// Env var name holding the OpenRouter (or other adapter's) API key,
    /// per adapter name — e.g. `("openrouter", "OPENROUTER_API_KEY")`.
    pub api_key_env_vars: Vec<(String, String)>,
    /// Search providers in fallback priority order (by name).
    pub search_provider_priority: Vec<String>,
    pub merge_threshold: f64,
    pub dedup_threshold: f64,
    pub confidence_discount: f64,
    pub consensus_boost: f64,
    pub max_searches_per_cycle: u32,
    /// Overall wall-clock budget for a single research cycle (selection
    /// through persistence). Not separately enforced by `cycle::execute`
    /// yet — carried here as the documented default for a future caller-
    /// side `tokio::time::timeout` wrapper.
    pub cycle_timeout: Duration,
    /// Per-request timeout for a single LLM/search/fetch HTTP call.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl EngineConfig {
    pub fn new(workspace_id: impl Into<String>, mission: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            mission: mission.into(),
            storage_path: None,
            api_key_env_vars: Vec::new(),
            search_provider_priority: Vec::new(),
            merge_threshold: 0.75,
            dedup_threshold: 0.85,
            confidence_discount: 0.7,
            consensus_boost: 0.15,
            max_searches_per_cycle: 25,
            cycle_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_api_key_env_var(mut self, adapter: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.api_key_env_vars.push((adapter.into(), env_var.into()));
        self
    }

    pub fn with_search_provider_priority(mut self, providers: Vec<String>) -> Self {
        self.search_provider_priority = providers;
        self
    }

    pub fn with_merge_threshold(mut self, threshold: f64) -> Self {
        self.merge_threshold = threshold;
        self
    }

    pub fn with_dedup_threshold(mut self, threshold: f64) -> Self {
        self.dedup_threshold = threshold;
        self
    }

    pub fn with_confidence_discount(mut self, discount: f64) -> Self {
        self.confidence_discount = discount;
        self
    }

    pub fn with_consensus_boost(mut self, boost: f64) -> Self {
        self.consensus_boost = boost;
        self
    }

    pub fn with_max_searches_per_cycle(mut self, n: u32) -> Self {
        self.max_searches_per_cycle = n;
        self
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Resolve a configured API key env var name to its current value.
    /// Returns `None` if the adapter has no configured env var, or the
    /// process environment doesn't have it set.
    pub fn resolve_api_key(&self, adapter: &str) -> Option<String> {
        let env_var = self.api_key_env_vars.iter().find(|(name, _)| name == adapter).map(|(_, v)| v.as_str())?;
        std::env::var(env_var).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = EngineConfig::new("ws", "Understand the thing");
        assert_eq!(config.merge_threshold, 0.75);
        assert_eq!(config.dedup_threshold, 0.85);
        assert_eq!(config.confidence_discount, 0.7);
        assert_eq!(config.consensus_boost, 0.15);
        assert_eq!(config.cycle_timeout, Duration::from_secs(300));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_policy.max_attempts, 3);
    }

    #[test]
    fn resolve_api_key_reads_configured_env_var() {
        std::env::set_var("NORTHSTAR_TEST_KEY", "secret-value");
        let config = EngineConfig::new("ws", "mission").with_api_key_env_var("openrouter", "NORTHSTAR_TEST_KEY");
        assert_eq!(config.resolve_api_key("openrouter"), Some("secret-value".to_string()));
        assert_eq!(config.resolve_api_key("anthropic"), None);
        std::env::remove_var("NORTHSTAR_TEST_KEY");
    }
}
