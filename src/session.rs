//! Session setup
//!
//! Validates the two clips, creates the engine context and loads the
//! requested models and feature extractors. Everything acquired here is
//! owned by an [`EngineScope`], so a failure at any step releases what was
//! already loaded.

use crate::config::{CoreInfo, FeatureRequest, ModelRequest, OutputFormat, VmafConfig};
use crate::engine::{EngineConfig, LogLevel, ModelConfig, ScoringEngine};
use crate::error::{Error, Result};
use crate::source::FrameSource;
use crate::types::{ColorFamily, PixelFormat, SampleType, VideoFormat, VideoInfo};

use std::path::PathBuf;
use std::sync::Arc;

/// A resolved model request
pub enum LoadedModel<E: ScoringEngine> {
    Standalone {
        request: ModelRequest,
        model: E::Model,
    },
    /// The engine only offers this model as a collection
    Collection {
        request: ModelRequest,
        collection: E::Collection,
    },
}

impl<E: ScoringEngine> LoadedModel<E> {
    pub fn request(&self) -> ModelRequest {
        match self {
            LoadedModel::Standalone { request, .. } | LoadedModel::Collection { request, .. } => {
                *request
            }
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, LoadedModel::Collection { .. })
    }
}

/// Engine context and the models loaded into it
///
/// Dropping the scope destroys standalone models, then collections, then
/// the context.
pub struct EngineScope<E: ScoringEngine> {
    engine: Option<E>,
    models: Vec<LoadedModel<E>>,
}

impl<E: ScoringEngine> EngineScope<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Some(engine),
            models: Vec::new(),
        }
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        self.engine.as_mut()
    }

    pub fn models(&self) -> &[LoadedModel<E>] {
        &self.models
    }

    /// Engine and models, borrowed together
    pub fn parts_mut(&mut self) -> Option<(&mut E, &[LoadedModel<E>])> {
        let models = &self.models;
        self.engine.as_mut().map(|e| (e, models.as_slice()))
    }

    fn push(&mut self, model: LoadedModel<E>) {
        self.models.push(model);
    }

    /// Destroy models, collections and the context, in that order
    pub fn destroy(&mut self) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };

        let (standalone, collections): (Vec<_>, Vec<_>) =
            self.models.drain(..).partition(|m| !m.is_collection());

        for loaded in standalone {
            if let LoadedModel::Standalone { model, .. } = loaded {
                engine.destroy_model(model);
            }
        }
        for loaded in collections {
            if let LoadedModel::Collection { collection, .. } = loaded {
                engine.destroy_collection(collection);
            }
        }
        engine.close();
        tracing::debug!("Engine context closed");
    }
}

impl<E: ScoringEngine> Drop for EngineScope<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Everything one invocation needs, fully validated
pub struct Session<E: ScoringEngine> {
    // Field order is drop order: engine before streams
    pub(crate) scope: EngineScope<E>,
    pub(crate) reference: Arc<dyn FrameSource>,
    pub(crate) distorted: Arc<dyn FrameSource>,
    pub(crate) info: VideoInfo,
    pub(crate) format: VideoFormat,
    pub(crate) log_path: PathBuf,
    pub(crate) log_format: OutputFormat,
    pub(crate) features: Vec<FeatureRequest>,
    pub(crate) chroma: bool,
    pub(crate) pixel_format: PixelFormat,
}

impl<E: ScoringEngine> Session<E> {
    /// Validate the clips and configuration, then bring up the engine.
    ///
    /// `init_engine` receives the engine settings derived from `core` and
    /// `config` and returns a fresh context.
    pub fn create<F>(
        core: CoreInfo,
        reference: Arc<dyn FrameSource>,
        distorted: Arc<dyn FrameSource>,
        config: &VmafConfig,
        init_engine: F,
    ) -> Result<Self>
    where
        F: FnOnce(EngineConfig) -> Result<E>,
    {
        let info = reference.info();
        let distorted_info = distorted.info();
        let format = validate_format(&info)?;
        validate_format(&distorted_info)?;

        let log_format = OutputFormat::from_code(config.log_format)
            .ok_or_else(|| Error::config("log_format must be 0, 1, 2, or 3"))?;

        if !distorted_info.same_format(&info) {
            return Err(Error::config(
                "both clips must have the same format and dimensions",
            ));
        }
        if distorted_info.num_frames != info.num_frames {
            return Err(Error::config("both clips' number of frames do not match"));
        }

        let models = parse_models(&config.models)?;
        let features = parse_features(&config.features)?;

        let pixel_format = PixelFormat::from_subsampling(format.sub_sampling_w, format.sub_sampling_h)
            .ok_or_else(|| Error::config("only 420/422/444 chroma subsampling is supported"))?;

        let engine_config = EngineConfig {
            log_level: LogLevel::Info,
            n_threads: config.threads.unwrap_or(core.num_threads).max(1),
            n_subsample: 1,
            cpumask: 0,
        };
        let engine = init_engine(engine_config).map_err(|e| {
            Error::config(format!("failed to initialize VMAF context: {}", e.message()))
        })?;
        let mut scope = EngineScope::new(engine);

        if let Some(accel) = &config.accelerator {
            let engine = engine_of(&mut scope)?;
            let state = engine.init_accelerator(accel).map_err(|e| {
                Error::config(format!("problem during accelerator state init: {}", e.message()))
            })?;
            engine.import_accelerator(state).map_err(|e| {
                Error::config(format!("problem during accelerator state import: {}", e.message()))
            })?;
            tracing::info!("Accelerator state imported");
        }

        for request in &models {
            let loaded = load_model(engine_of(&mut scope)?, *request)?;
            if loaded.is_collection() {
                tracing::info!("Loaded {} as a model collection", request.version());
            } else {
                tracing::info!("Loaded model {}", request.version());
            }
            scope.push(loaded);
        }

        let mut chroma = models.iter().any(|m| m.requires_chroma());
        for feature in &features {
            engine_of(&mut scope)?
                .use_feature(feature.name())
                .map_err(|e| {
                    Error::config(format!(
                        "failed to load feature extractor: {}: {}",
                        feature.name(),
                        e.message()
                    ))
                })?;
            chroma |= feature.requires_chroma();
        }

        tracing::info!(
            "Session ready: {} as {} ({} models, {} features, chroma {})",
            info,
            pixel_format,
            models.len(),
            features.len(),
            if chroma { "on" } else { "off" }
        );

        Ok(Self {
            scope,
            reference,
            distorted,
            info,
            format,
            log_path: config.log_path.clone(),
            log_format,
            features,
            chroma,
            pixel_format,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Whether chroma planes are copied into native pictures
    pub fn chroma(&self) -> bool {
        self.chroma
    }

    pub fn features(&self) -> &[FeatureRequest] {
        &self.features
    }

    pub fn models(&self) -> &[LoadedModel<E>] {
        self.scope.models()
    }
}

fn engine_of<E: ScoringEngine>(scope: &mut EngineScope<E>) -> Result<&mut E> {
    scope
        .engine_mut()
        .ok_or_else(|| Error::config("VMAF context is closed"))
}

/// Constant YUV integer input with a supported depth and layout
fn validate_format(info: &VideoInfo) -> Result<VideoFormat> {
    let format = match info.format {
        Some(f) if info.is_constant() => f,
        _ => return Err(Error::config("only constant YUV format integer input supported")),
    };
    if format.color_family != ColorFamily::Yuv || format.sample_type != SampleType::Integer {
        return Err(Error::config("only constant YUV format integer input supported"));
    }
    if !matches!(format.bits_per_sample, 8 | 10 | 12 | 16) {
        return Err(Error::config("only 8, 10, 12 and 16 bit depth supported"));
    }
    if PixelFormat::from_subsampling(format.sub_sampling_w, format.sub_sampling_h).is_none() {
        return Err(Error::config("only 420/422/444 chroma subsampling is supported"));
    }
    Ok(format)
}

fn parse_models(codes: &[i64]) -> Result<Vec<ModelRequest>> {
    let mut models: Vec<ModelRequest> = Vec::with_capacity(codes.len());
    for &code in codes {
        let model = ModelRequest::from_index(code)
            .ok_or_else(|| Error::config("model must be 0, 1, 2, or 3"))?;
        if models.contains(&model) {
            return Err(Error::config("duplicate model specified"));
        }
        models.push(model);
    }
    Ok(models)
}

fn parse_features(codes: &[i64]) -> Result<Vec<FeatureRequest>> {
    let mut features: Vec<FeatureRequest> = Vec::with_capacity(codes.len());
    for &code in codes {
        let feature = FeatureRequest::from_index(code)
            .ok_or_else(|| Error::config("feature must be 0, 1, 2, 3, or 4"))?;
        if features.contains(&feature) {
            return Err(Error::config("duplicate feature specified"));
        }
        features.push(feature);
    }
    Ok(features)
}

/// Standalone first; any standalone failure falls back to collection loading
fn load_model<E: ScoringEngine>(engine: &mut E, request: ModelRequest) -> Result<LoadedModel<E>> {
    let config = ModelConfig::new(request.name(), request.version());

    match engine.model_load(&config) {
        Ok(model) => {
            if let Err(e) = engine.use_features_from_model(&model) {
                engine.destroy_model(model);
                return Err(Error::config(format!(
                    "failed to load feature extractors from model: {}: {}",
                    request.version(),
                    e.message()
                )));
            }
            Ok(LoadedModel::Standalone { request, model })
        }
        Err(standalone_err) => {
            tracing::debug!(
                "{} not loadable as a standalone model ({}), trying collection",
                request.version(),
                standalone_err.message()
            );
            let collection = engine.model_collection_load(&config).map_err(|e| {
                Error::config(format!(
                    "failed to load model: {} ({}; {})",
                    request.version(),
                    standalone_err.message(),
                    e.message()
                ))
            })?;
            if let Err(e) = engine.use_features_from_collection(&collection) {
                engine.destroy_collection(collection);
                return Err(Error::config(format!(
                    "failed to load feature extractors from model collection: {}: {}",
                    request.version(),
                    e.message()
                )));
            }
            Ok(LoadedModel::Collection {
                request,
                collection,
            })
        }
    }
}
