//! vmafbridge: VMAF scoring for pull-based video pipelines
//!
//! Feeds reference/distorted frame pairs from a frame-request runtime into
//! a push-based quality engine and writes a pooled report at end of stream.
//!
//! # Features
//!
//! - **Setup**: clip validation, model and model-collection loading, feature extractors
//! - **Ingestion**: concurrent frame requests, strictly ordered engine submission
//! - **Teardown**: flush, per-model pooling and report writing, exactly once
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmafbridge::{CoreInfo, ToolEngine, VmafConfig, VmafFilter, Y4mSource};
//!
//! #[tokio::main]
//! async fn main() -> vmafbridge::Result<()> {
//!     let reference = Arc::new(Y4mSource::open("reference.y4m")?);
//!     let distorted = Arc::new(Y4mSource::open("distorted.y4m")?);
//!     let config = VmafConfig::new("vmaf.json").with_log_format(1).with_models([0]);
//!
//!     let filter = Arc::new(VmafFilter::create(
//!         CoreInfo::detect(),
//!         reference,
//!         distorted,
//!         &config,
//!         ToolEngine::init,
//!     )?);
//!     filter.process_all(8).await?;
//!     println!("{:?}", filter.finish().scores);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod picture;
pub mod session;
pub mod source;
pub mod types;

// Re-exports for convenience
pub use config::{CoreInfo, FeatureRequest, ModelRequest, OutputFormat, VmafConfig};
pub use engine::{ScoringEngine, ToolEngine};
pub use error::{Error, ErrorKind, Result};
pub use filter::{PooledScore, Report, Score, VmafFilter};
pub use session::Session;
pub use source::{FrameSource, MemorySource, Y4mSource};
pub use types::{Frame, PixelFormat, VideoFormat, VideoInfo};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if the `vmaf` tool backing [`ToolEngine`] is available
pub fn is_vmaf_available() -> bool {
    engine::tool::is_available()
}
