// src/config.rs
//! Aggregator configuration: TOML file with env-path override and hard
//! defaults, so the engine always boots even with no config present.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_CONFIG_PATH: &str = "AGGREGATOR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/aggregator.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Authoritative-source order for dedup tie-breaks. Unlisted sources
    /// rank last; ties fall back to most recent published_at.
    pub source_priority: Vec<String>,
    /// Cap on simultaneous outbound (uf × source) fetches.
    pub max_concurrent_fetches: usize,
    /// Per-source fetch deadline in milliseconds.
    pub per_source_timeout_ms: u64,
    /// Whole-search deadline in milliseconds; on expiry partial results are
    /// delivered as degraded rather than failing the response.
    pub search_timeout_ms: u64,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub progress: ProgressConfig,
    pub summary: SummaryConfig,
    /// Fallback sector keywords used when all custom terms are eliminated
    /// by stopword/length filtering.
    pub sector_keywords: Vec<String>,
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before CLOSED → OPEN.
    pub failure_threshold: u32,
    /// OPEN → HALF_OPEN after this cooldown.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per window per source, shared across worker processes.
    pub requests_per_window: u32,
    pub window_secs: u64,
    /// Upper bound on how long `acquire` may suspend the caller.
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 30,
            window_secs: 10,
            max_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fast process-local tier.
    pub local_ttl_secs: u64,
    /// Shared tier visible to all worker processes.
    pub shared_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_secs: 60,
            shared_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// How long progress channels/snapshots outlive the search.
    pub grace_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { grace_secs: 120 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Bounded wait on the AI path before the statistical fallback wins.
    pub ai_wait_ms: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self { ai_wait_ms: 4_000 }
    }
}

/// Backend selection for cross-process shared state. Chosen once at startup,
/// never mixed mid-request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// "local" | "rest"
    pub backend: String,
    /// REST command endpoint, e.g. an Upstash-style URL. Required for "rest".
    pub url: Option<String>,
    /// Bearer token for the REST endpoint. Falls back to $COORDINATION_TOKEN.
    pub token: Option<String>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            url: None,
            token: None,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            source_priority: vec![
                "pncp".to_string(),
                "comprasnet".to_string(),
                "transparencia".to_string(),
            ],
            max_concurrent_fetches: 8,
            per_source_timeout_ms: 15_000,
            search_timeout_ms: 60_000,
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            progress: ProgressConfig::default(),
            summary: SummaryConfig::default(),
            sector_keywords: vec![
                "obra".to_string(),
                "reforma".to_string(),
                "construção".to_string(),
                "engenharia".to_string(),
                "pavimentação".to_string(),
            ],
            coordination: CoordinationConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Load from an explicit TOML path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading aggregator config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing aggregator config from {}", path.display()))
    }

    /// Load using env var + fallbacks:
    /// 1) $AGGREGATOR_CONFIG_PATH
    /// 2) config/aggregator.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        Ok(Self::default())
    }

    /// Rank of a source in the authoritative order; unlisted sources rank
    /// after all listed ones.
    pub fn source_rank(&self, source: &str) -> usize {
        self.source_priority
            .iter()
            .position(|s| s.eq_ignore_ascii_case(source))
            .unwrap_or(self.source_priority.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn defaults_are_sane() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.source_priority[0], "pncp");
        assert!(cfg.cache.shared_ttl_secs > cfg.cache.local_ttl_secs);
        assert!(cfg.per_source_timeout_ms < cfg.search_timeout_ms);
    }

    #[test]
    fn source_rank_prefers_listed_order() {
        let cfg = AggregatorConfig::default();
        assert!(cfg.source_rank("pncp") < cfg.source_rank("comprasnet"));
        assert!(cfg.source_rank("comprasnet") < cfg.source_rank("unknown-src"));
        // Case-insensitive match.
        assert_eq!(cfg.source_rank("PNCP"), 0);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml = r#"
            max_concurrent_fetches = 3

            [breaker]
            failure_threshold = 2
        "#;
        let cfg: AggregatorConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_fetches, 3);
        assert_eq!(cfg.breaker.failure_threshold, 2);
        // Untouched sections keep defaults.
        assert_eq!(cfg.rate_limit.window_secs, 10);
        assert_eq!(cfg.coordination.backend, "local");
    }

    #[serial_test::serial]
    #[test]
    fn load_default_reads_env_path() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("agg.toml");
        std::fs::write(&p, "max_concurrent_fetches = 2\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        let cfg = AggregatorConfig::load_default().unwrap();
        assert_eq!(cfg.max_concurrent_fetches, 2);
        env::remove_var(ENV_CONFIG_PATH);
    }
}
