// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod aggregate;
pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod coord;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod ratelimit;
pub mod search;
pub mod sources;
pub mod summary;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::model::{SearchFingerprint, SearchRequest, UnifiedProcurement};
pub use crate::search::{SearchOptions, SearchResponse, SearchService};
