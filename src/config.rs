//! Configuration types for vmafbridge

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Report format written at teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    Xml,
    Json,
    Csv,
    /// Subtitle overlay
    Subtitle,
}

impl OutputFormat {
    /// Parse the invocation code (0=XML, 1=JSON, 2=CSV, 3=subtitle)
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OutputFormat::Xml),
            1 => Some(OutputFormat::Json),
            2 => Some(OutputFormat::Csv),
            3 => Some(OutputFormat::Subtitle),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            OutputFormat::Xml => 0,
            OutputFormat::Json => 1,
            OutputFormat::Csv => 2,
            OutputFormat::Subtitle => 3,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Xml => "xml",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Subtitle => "sub",
        }
    }
}

/// Canonical VMAF models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelRequest {
    /// vmaf_v0.6.1
    Default,
    /// No-enhancement-gain variant
    Neg,
    /// Bootstrapped variant with confidence intervals
    B,
    /// Tuned for 4K viewing
    FourK,
}

impl ModelRequest {
    pub const ALL: [ModelRequest; 4] = [
        ModelRequest::Default,
        ModelRequest::Neg,
        ModelRequest::B,
        ModelRequest::FourK,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Name the pooled score is reported under
    pub fn name(&self) -> &'static str {
        match self {
            ModelRequest::Default => "vmaf",
            ModelRequest::Neg => "vmaf_neg",
            ModelRequest::B => "vmaf_b",
            ModelRequest::FourK => "vmaf_4k",
        }
    }

    /// Built-in model version the engine loads
    pub fn version(&self) -> &'static str {
        match self {
            ModelRequest::Default => "vmaf_v0.6.1",
            ModelRequest::Neg => "vmaf_v0.6.1neg",
            ModelRequest::B => "vmaf_b_v0.6.3",
            ModelRequest::FourK => "vmaf_4k_v0.6.1",
        }
    }

    /// None of the canonical models read chroma
    pub fn requires_chroma(&self) -> bool {
        false
    }
}

/// Auxiliary feature extractors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureRequest {
    Psnr,
    PsnrHvs,
    FloatSsim,
    FloatMsSsim,
    Ciede,
}

impl FeatureRequest {
    pub const ALL: [FeatureRequest; 5] = [
        FeatureRequest::Psnr,
        FeatureRequest::PsnrHvs,
        FeatureRequest::FloatSsim,
        FeatureRequest::FloatMsSsim,
        FeatureRequest::Ciede,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Extractor name registered with the engine
    pub fn name(&self) -> &'static str {
        match self {
            FeatureRequest::Psnr => "psnr",
            FeatureRequest::PsnrHvs => "psnr_hvs",
            FeatureRequest::FloatSsim => "float_ssim",
            FeatureRequest::FloatMsSsim => "float_ms_ssim",
            FeatureRequest::Ciede => "ciede",
        }
    }

    /// Extractors that read the chroma planes
    pub fn requires_chroma(&self) -> bool {
        matches!(
            self,
            FeatureRequest::Psnr | FeatureRequest::PsnrHvs | FeatureRequest::Ciede
        )
    }
}

/// Accelerator (GPU) execution settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    /// Device ordinal, `None` for the engine's default device
    pub device: Option<u32>,
}

/// Invocation parameters for one VMAF run
///
/// Model, feature and format codes are kept as raw integers so that range
/// and duplicate checks happen during session setup, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmafConfig {
    /// Report destination
    pub log_path: PathBuf,
    /// 0=XML, 1=JSON, 2=CSV, 3=subtitle
    pub log_format: i64,
    /// Each entry selects a canonical model (0-3)
    pub models: Vec<i64>,
    /// Each entry selects an auxiliary metric (0-4)
    pub features: Vec<i64>,
    /// Engine thread count (None = host thread count)
    pub threads: Option<usize>,
    /// Accelerator execution path
    pub accelerator: Option<AcceleratorConfig>,
}

impl Default for VmafConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("vmaf.xml"),
            log_format: 0,
            models: Vec::new(),
            features: Vec::new(),
            threads: None,
            accelerator: None,
        }
    }
}

impl VmafConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            ..Default::default()
        }
    }

    pub fn with_log_format(mut self, code: i64) -> Self {
        self.log_format = code;
        self
    }

    pub fn with_models(mut self, models: impl IntoIterator<Item = i64>) -> Self {
        self.models = models.into_iter().collect();
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = i64>) -> Self {
        self.features = features.into_iter().collect();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_accelerator(mut self, accelerator: AcceleratorConfig) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    /// Load a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// What the host runtime reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreInfo {
    pub num_threads: usize,
}

impl CoreInfo {
    pub fn new(num_threads: usize) -> Self {
        Self { num_threads }
    }

    /// Use the machine's available parallelism
    pub fn detect() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { num_threads }
    }
}

impl Default for CoreInfo {
    fn default() -> Self {
        Self::detect()
    }
}
