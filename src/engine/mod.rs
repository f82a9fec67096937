//! Scoring engine interface
//!
//! The engine performs the pixel-domain metric computation, model loading
//! and score pooling. vmafbridge only drives it:
//! - register models, model collections and feature extractors
//! - submit picture pairs keyed by frame index
//! - flush, pool and write the report at end of stream

pub mod tool;

pub use tool::ToolEngine;

use crate::config::{AcceleratorConfig, OutputFormat};
use crate::error::{Error, Result};
use crate::types::{PixelFormat, Plane};
use std::path::Path;
use std::sync::Arc;

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Engine context settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub log_level: LogLevel,
    pub n_threads: usize,
    /// Score every n-th frame
    pub n_subsample: u32,
    /// Disabled CPU feature bits, 0 = use everything
    pub cpumask: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            n_threads: 1,
            n_subsample: 1,
            cpumask: 0,
        }
    }
}

/// Model identity passed to the loaders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Name the scores are reported under
    pub name: String,
    /// Built-in model version
    pub version: String,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// How per-frame scores are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMethod {
    Min,
    Max,
    #[default]
    Mean,
    HarmonicMean,
}

impl PoolMethod {
    pub fn name(&self) -> &'static str {
        match self {
            PoolMethod::Min => "min",
            PoolMethod::Max => "max",
            PoolMethod::Mean => "mean",
            PoolMethod::HarmonicMean => "harmonic_mean",
        }
    }

    /// Pool a series of per-frame scores, `None` when empty
    pub fn pool(&self, scores: &[f64]) -> Option<f64> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f64;
        let pooled = match self {
            PoolMethod::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
            PoolMethod::Max => scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            PoolMethod::Mean => scores.iter().sum::<f64>() / n,
            PoolMethod::HarmonicMean => {
                n / scores.iter().map(|s| 1.0 / (s + 1.0)).sum::<f64>() - 1.0
            }
        };
        Some(pooled)
    }
}

/// Pooled score of a model collection
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollectionScore {
    pub bagging: f64,
    pub stddev: f64,
    pub ci_p95_lo: f64,
    pub ci_p95_hi: f64,
}

/// Engine-native planar picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub pix_fmt: PixelFormat,
    pub bpc: u32,
    pub width: u32,
    pub height: u32,
    pub planes: [Plane; 3],
}

impl Picture {
    /// Allocate a zeroed picture; fails instead of aborting when memory is short
    pub fn alloc(pix_fmt: PixelFormat, bpc: u32, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Allocation(format!(
                "failed to allocate picture: invalid dimensions {}x{}",
                width, height
            )));
        }
        if !matches!(bpc, 8 | 10 | 12 | 16) {
            return Err(Error::Allocation(format!(
                "failed to allocate picture: unsupported bit depth {}",
                bpc
            )));
        }

        let bytes = if bpc > 8 { 2 } else { 1 };
        let (ss_x, ss_y) = pix_fmt.chroma_shift();
        let dims = [
            (width, height),
            (width.div_ceil(1 << ss_x), height.div_ceil(1 << ss_y)),
            (width.div_ceil(1 << ss_x), height.div_ceil(1 << ss_y)),
        ];

        let alloc_plane = |(w, h): (u32, u32)| -> Result<Plane> {
            let stride = (w as usize * bytes).div_ceil(Self::ALIGNMENT) * Self::ALIGNMENT;
            let len = stride * h as usize;
            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|e| Error::Allocation(format!("failed to allocate picture: {}", e)))?;
            data.resize(len, 0);
            Ok(Plane {
                data,
                stride,
                width: w,
                height: h,
            })
        };

        Ok(Self {
            pix_fmt,
            bpc,
            width,
            height,
            planes: [
                alloc_plane(dims[0])?,
                alloc_plane(dims[1])?,
                alloc_plane(dims[2])?,
            ],
        })
    }

    /// Row alignment of native planes
    pub const ALIGNMENT: usize = 32;

    pub fn bytes_per_sample(&self) -> usize {
        if self.bpc > 8 {
            2
        } else {
            1
        }
    }

    /// Plane bytes without stride padding
    pub fn packed_plane(&self, index: usize) -> Vec<u8> {
        let plane = &self.planes[index];
        let row_bytes = plane.width as usize * self.bytes_per_sample();
        let mut out = Vec::with_capacity(row_bytes * plane.height as usize);
        for y in 0..plane.height as usize {
            out.extend_from_slice(&plane.row(y)[..row_bytes]);
        }
        out
    }
}

/// Native picture allocation, shared by all in-flight requests
pub trait PictureAllocator: Send + Sync {
    fn alloc_picture(
        &self,
        pix_fmt: PixelFormat,
        bpc: u32,
        width: u32,
        height: u32,
    ) -> Result<Picture> {
        Picture::alloc(pix_fmt, bpc, width, height)
    }
}

/// Heap allocation through [`Picture::alloc`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAllocator;

impl PictureAllocator for DefaultAllocator {}

/// Trait for scoring engines
///
/// One value of an implementing type is one engine context. Handles returned
/// by the loaders stay owned by the caller until handed back to
/// [`destroy_model`](ScoringEngine::destroy_model) /
/// [`destroy_collection`](ScoringEngine::destroy_collection).
pub trait ScoringEngine: Send + 'static {
    /// Standalone model handle
    type Model: Send;
    /// Model collection handle
    type Collection: Send;
    /// Initialized accelerator state, consumed on import
    type AcceleratorState;

    /// Initialize accelerator state
    fn init_accelerator(&mut self, config: &AcceleratorConfig) -> Result<Self::AcceleratorState>;

    /// Import accelerator state into this context
    fn import_accelerator(&mut self, state: Self::AcceleratorState) -> Result<()>;

    /// Load a standalone model
    fn model_load(&mut self, config: &ModelConfig) -> Result<Self::Model>;

    /// Load a model that only exists as a collection
    fn model_collection_load(&mut self, config: &ModelConfig) -> Result<Self::Collection>;

    /// Register the feature extractors a model needs
    fn use_features_from_model(&mut self, model: &Self::Model) -> Result<()>;

    /// Register the feature extractors a collection needs
    fn use_features_from_collection(&mut self, collection: &Self::Collection) -> Result<()>;

    /// Register a named feature extractor with default options
    fn use_feature(&mut self, name: &str) -> Result<()>;

    /// Picture allocator. Called once per filter; allocation then runs
    /// without access to the engine, concurrently with submissions.
    fn allocator(&self) -> Arc<dyn PictureAllocator> {
        Arc::new(DefaultAllocator)
    }

    /// Submit a picture pair for frame `index`. The pictures are consumed
    /// whether or not the engine accepts them.
    fn read_pictures(&mut self, reference: Picture, distorted: Picture, index: u32) -> Result<()>;

    /// Signal end of stream (the null picture pair)
    fn flush(&mut self) -> Result<()>;

    /// Pool a model's per-frame scores over `first..=last`
    fn score_pooled(
        &mut self,
        model: &Self::Model,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<f64>;

    /// Pool a collection's per-frame scores over `first..=last`
    fn score_pooled_collection(
        &mut self,
        collection: &Self::Collection,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<CollectionScore>;

    /// Write the aggregated report
    fn write_output(&mut self, path: &Path, format: OutputFormat) -> Result<()>;

    fn destroy_model(&mut self, model: Self::Model) {
        drop(model);
    }

    fn destroy_collection(&mut self, collection: Self::Collection) {
        drop(collection);
    }

    /// Destroy the context
    fn close(self)
    where
        Self: Sized,
    {
    }
}
