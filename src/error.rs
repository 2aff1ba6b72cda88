// src/error.rs
//! Failure taxonomy for the aggregation pipeline.
//!
//! Only `Validation` and `AllSourcesUnavailable` abort a search; every other
//! variant degrades coverage and is reported on the response instead.

use thiserror::Error;

/// What went wrong inside one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFailureKind {
    /// Non-success HTTP status from the provider.
    Http(u16),
    /// Connect/transport error before any response.
    Network,
    /// Response arrived but could not be decoded.
    Parse,
    /// Per-source deadline elapsed.
    Timeout,
}

impl std::fmt::Display for SourceFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFailureKind::Http(code) => write!(f, "http status {code}"),
            SourceFailureKind::Network => f.write_str("network error"),
            SourceFailureKind::Parse => f.write_str("parse error"),
            SourceFailureKind::Timeout => f.write_str("timeout"),
        }
    }
}

/// One adapter's failure. Isolated at the aggregator boundary; never fails
/// the whole search on its own.
///
/// `Display`/`Error` are hand-written: the `source` field names the
/// provider, not an error cause, which rules out the derive.
#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub source: String,
    pub kind: SourceFailureKind,
    pub detail: Option<String>,
}

impl std::fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source '{}' failed: {}", self.source, self.kind)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SourceFailure {}

impl SourceFailure {
    pub fn new(source: impl Into<String>, kind: SourceFailureKind) -> Self {
        Self {
            source: source.into(),
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Errors surfaced by `SearchService::search`.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Malformed request; returned immediately, no partial work attempted.
    #[error("invalid search request: {0}")]
    Validation(String),

    /// Every configured source failed or was skipped. Distinct from "zero
    /// results after filtering", which is a successful response.
    #[error("all sources unavailable: {0:?}")]
    AllSourcesUnavailable(Vec<String>),
}

/// A source deliberately skipped because its breaker is open.
#[derive(Debug, Clone)]
pub struct CircuitOpen {
    pub source: String,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit open for source '{}'", self.source)
    }
}

impl std::error::Error for CircuitOpen {}

/// Outcome of a breaker-guarded call: either the adapter's own failure or a
/// deliberate skip.
#[derive(Debug, Error)]
pub enum GuardedCallError {
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error(transparent)]
    Source(#[from] SourceFailure),
}

/// The shared rate limit could not grant a token within the bounded wait.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    pub source: String,
    pub waited_ms: u64,
}

impl std::fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limit exceeded for source '{}' after waiting {}ms",
            self.source, self.waited_ms
        )
    }
}

impl std::error::Error for RateLimitExceeded {}

/// The coordination service did not answer. Triggers degraded/local-only
/// operation, never a search failure.
#[derive(Debug, Clone, Error)]
#[error("coordination service unavailable: {0}")]
pub struct CoordinationUnavailable(pub String);
