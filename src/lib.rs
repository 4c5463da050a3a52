//! Real-time telemetry acquisition and lap/sector timing.
//!
//! Laptrace samples a racing simulator at a fixed rate, keeps a rolling
//! window of recent frames, times every sector and lap against the track's
//! sector layout, and hands finished laps to a local artifact writer and a
//! remote session store.
//!
//! # Features
//!
//! - **Non-blocking producer**: a full work queue drops frames, never stalls sampling
//! - **Sector timing**: bests, comparisons and partial laps from the sector layout
//! - **Session tracking**: resumes or creates the remote session on every layout change
//! - **Durable laps**: JSON artifacts on disk, bounded retries against the store
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use laptrace::{MemorySessionStore, Pipeline, PipelineConfig, PipelineEvent, ReplaySource};
//!
//! #[tokio::main]
//! async fn main() -> laptrace::Result<()> {
//!     let source = ReplaySource::from_artifact("laps/lap_003_92.418s.json")?;
//!     let store = Arc::new(MemorySessionStore::new());
//!     let pipeline = Pipeline::spawn(source, store, PipelineConfig::default())?;
//!
//!     let mut events = pipeline.events();
//!     while let Some(event) = events.next().await {
//!         if let PipelineEvent::LapCompleted { record, .. } = event {
//!             println!("Lap {}: {:.3}s", record.lap_number, record.total_time);
//!             break;
//!         }
//!     }
//!
//!     pipeline.shutdown().await
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod diagnostics;
mod error;
pub mod layout;
pub mod persistence;
pub mod pipeline;
pub mod producer;
pub mod session;
pub mod source;
pub mod sources;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod timing;
pub mod types;
pub mod worker;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use config::PipelineConfig;
pub use diagnostics::{Diagnostic, PipelineEvent, StatsSnapshot};
pub use pipeline::Pipeline;
pub use session::{MemorySessionStore, SessionIdentity, SessionStore};
pub use source::TelemetrySource;
pub use sources::ReplaySource;
pub use timing::SectorTimingEngine;
