//! Recording scoring engine and frame sources for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vmafbridge::config::{AcceleratorConfig, OutputFormat};
use vmafbridge::engine::{
    CollectionScore, EngineConfig, ModelConfig, Picture, PictureAllocator, PoolMethod,
    ScoringEngine,
};
use vmafbridge::error::{Error, Result};
use vmafbridge::source::FrameSource;
use vmafbridge::types::{Frame, PixelFormat, VideoFormat, VideoInfo};
use vmafbridge::MemorySource;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Init(EngineConfig),
    AcceleratorInit,
    AcceleratorImport,
    ModelLoad(String),
    CollectionLoad(String),
    UseModel(String),
    UseCollection(String),
    UseFeature(String),
    Read(u32),
    Flush,
    Pool(String, u32, u32),
    PoolCollection(String, u32, u32),
    Write(PathBuf, OutputFormat),
    DestroyModel(String),
    DestroyCollection(String),
    Close,
}

/// Per-frame record of what the engine received
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub index: u32,
    pub vmaf: f64,
    pub chroma_filled: bool,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    pub submissions: Vec<Submission>,
}

impl Recorder {
    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events.iter().position(|e| e == event)
    }

    pub fn submitted(&self) -> Vec<u32> {
        self.submissions.iter().map(|s| s.index).collect()
    }
}

/// Failure injection
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Versions standalone loading rejects
    pub collection_only: Vec<&'static str>,
    /// Versions neither loader knows
    pub missing: Vec<&'static str>,
    pub reject_frame: Option<u32>,
    pub fail_flush: bool,
    pub fail_pool: bool,
    pub fail_feature: Option<&'static str>,
    pub fail_accelerator_import: bool,
    /// Fail the n-th picture allocation (0-based)
    pub fail_alloc: Option<usize>,
    /// Hold frame 0's submission until this many pictures were allocated
    pub hold_first_until_allocs: Option<usize>,
}

pub struct MockModel {
    name: String,
}

pub struct MockCollection {
    name: String,
}

/// Counts allocations, failing the configured one
pub struct MockAllocator {
    allocations: Arc<AtomicUsize>,
    fail_at: Option<usize>,
}

impl PictureAllocator for MockAllocator {
    fn alloc_picture(
        &self,
        pix_fmt: PixelFormat,
        bpc: u32,
        width: u32,
        height: u32,
    ) -> Result<Picture> {
        let n = self.allocations.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(n) {
            return Err(Error::Allocation("failed to allocate picture".into()));
        }
        Picture::alloc(pix_fmt, bpc, width, height)
    }
}

pub struct MockEngine {
    log: Arc<Mutex<Recorder>>,
    faults: Faults,
    features: Vec<String>,
    allocations: Arc<AtomicUsize>,
    next: u32,
}

impl MockEngine {
    pub fn factory(
        log: &Arc<Mutex<Recorder>>,
        faults: Faults,
    ) -> impl FnOnce(EngineConfig) -> Result<MockEngine> {
        let log = Arc::clone(log);
        move |config| {
            log.lock().events.push(Event::Init(config));
            Ok(MockEngine {
                log,
                faults,
                features: Vec::new(),
                allocations: Arc::new(AtomicUsize::new(0)),
                next: 0,
            })
        }
    }

    fn push(&self, event: Event) {
        self.log.lock().events.push(event);
    }

    fn series(&self, first: u32, last: u32) -> Vec<f64> {
        self.log
            .lock()
            .submissions
            .iter()
            .filter(|s| s.index >= first && s.index <= last)
            .map(|s| s.vmaf)
            .collect()
    }
}

/// 100 minus the mean absolute luma difference
fn luma_score(reference: &Picture, distorted: &Picture) -> f64 {
    let a = reference.packed_plane(0);
    let b = distorted.packed_plane(0);
    let diff: f64 = a
        .iter()
        .zip(&b)
        .map(|(x, y)| (*x as f64 - *y as f64).abs())
        .sum();
    (100.0 - diff / a.len().max(1) as f64).max(0.0)
}

impl ScoringEngine for MockEngine {
    type Model = MockModel;
    type Collection = MockCollection;
    type AcceleratorState = ();

    fn init_accelerator(&mut self, _config: &AcceleratorConfig) -> Result<()> {
        self.push(Event::AcceleratorInit);
        Ok(())
    }

    fn import_accelerator(&mut self, _state: ()) -> Result<()> {
        self.push(Event::AcceleratorImport);
        if self.faults.fail_accelerator_import {
            return Err(Error::config("device lost"));
        }
        Ok(())
    }

    fn model_load(&mut self, config: &ModelConfig) -> Result<MockModel> {
        if self.faults.missing.contains(&config.version.as_str()) {
            return Err(Error::config("no such model"));
        }
        if self.faults.collection_only.contains(&config.version.as_str()) {
            return Err(Error::config("not a standalone model"));
        }
        self.push(Event::ModelLoad(config.version.clone()));
        Ok(MockModel {
            name: config.name.clone(),
        })
    }

    fn model_collection_load(&mut self, config: &ModelConfig) -> Result<MockCollection> {
        if self.faults.missing.contains(&config.version.as_str()) {
            return Err(Error::config("no such collection"));
        }
        if !self.faults.collection_only.contains(&config.version.as_str()) {
            return Err(Error::config("not a collection"));
        }
        self.push(Event::CollectionLoad(config.version.clone()));
        Ok(MockCollection {
            name: config.name.clone(),
        })
    }

    fn use_features_from_model(&mut self, model: &MockModel) -> Result<()> {
        self.push(Event::UseModel(model.name.clone()));
        Ok(())
    }

    fn use_features_from_collection(&mut self, collection: &MockCollection) -> Result<()> {
        self.push(Event::UseCollection(collection.name.clone()));
        Ok(())
    }

    fn use_feature(&mut self, name: &str) -> Result<()> {
        if self.faults.fail_feature == Some(name) {
            return Err(Error::config("unknown extractor"));
        }
        self.push(Event::UseFeature(name.to_string()));
        self.features.push(name.to_string());
        Ok(())
    }

    fn allocator(&self) -> Arc<dyn PictureAllocator> {
        Arc::new(MockAllocator {
            allocations: Arc::clone(&self.allocations),
            fail_at: self.faults.fail_alloc,
        })
    }

    fn read_pictures(&mut self, reference: Picture, distorted: Picture, index: u32) -> Result<()> {
        self.push(Event::Read(index));
        if let (0, Some(wanted)) = (index, self.faults.hold_first_until_allocs) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.allocations.load(Ordering::SeqCst) < wanted {
                if Instant::now() > deadline {
                    return Err(Error::ingestion("allocations stalled behind submission"));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if self.faults.reject_frame == Some(index) {
            return Err(Error::ingestion("engine rejected picture"));
        }
        if index != self.next {
            return Err(Error::ingestion(format!(
                "out of order: got {}, expected {}",
                index, self.next
            )));
        }
        self.next += 1;
        let submission = Submission {
            index,
            vmaf: luma_score(&reference, &distorted),
            chroma_filled: reference.planes[1].data.iter().any(|&b| b != 0),
        };
        self.log.lock().submissions.push(submission);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.push(Event::Flush);
        if self.faults.fail_flush {
            return Err(Error::reporting("flush refused"));
        }
        Ok(())
    }

    fn score_pooled(
        &mut self,
        model: &MockModel,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<f64> {
        self.push(Event::Pool(model.name.clone(), first, last));
        if self.faults.fail_pool {
            return Err(Error::reporting("pooling refused"));
        }
        method
            .pool(&self.series(first, last))
            .ok_or_else(|| Error::reporting("no scores"))
    }

    fn score_pooled_collection(
        &mut self,
        collection: &MockCollection,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<CollectionScore> {
        self.push(Event::PoolCollection(collection.name.clone(), first, last));
        let mean = method
            .pool(&self.series(first, last))
            .ok_or_else(|| Error::reporting("no scores"))?;
        Ok(CollectionScore {
            bagging: mean,
            stddev: 0.0,
            ci_p95_lo: mean,
            ci_p95_hi: mean,
        })
    }

    fn write_output(&mut self, path: &Path, format: OutputFormat) -> Result<()> {
        self.push(Event::Write(path.to_path_buf(), format));
        let log = self.log.lock();
        let frames: Vec<serde_json::Value> = log
            .submissions
            .iter()
            .map(|s| {
                let mut metrics = serde_json::Map::new();
                metrics.insert("vmaf".into(), s.vmaf.into());
                for feature in &self.features {
                    metrics.insert(feature.clone(), 0.0.into());
                }
                serde_json::json!({ "frameNum": s.index, "metrics": metrics })
            })
            .collect();
        let doc = serde_json::json!({ "frames": frames });
        std::fs::write(path, doc.to_string()).map_err(|e| Error::reporting(e.to_string()))
    }

    fn destroy_model(&mut self, model: MockModel) {
        self.push(Event::DestroyModel(model.name));
    }

    fn destroy_collection(&mut self, collection: MockCollection) {
        self.push(Event::DestroyCollection(collection.name));
    }

    fn close(self) {
        self.push(Event::Close);
    }
}

/// Source that counts requests and delivers higher indices first
pub struct SlowSource {
    inner: MemorySource,
    pub requests: AtomicU32,
    delay_ms: u64,
}

impl SlowSource {
    pub fn new(inner: MemorySource, delay_ms: u64) -> Self {
        Self {
            inner,
            requests: AtomicU32::new(0),
            delay_ms,
        }
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FrameSource for SlowSource {
    fn info(&self) -> VideoInfo {
        self.inner.info()
    }

    async fn get_frame(&self, n: u32) -> Result<Frame> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let frames = self.inner.info().num_frames as u64;
        let wait = self.delay_ms * frames.saturating_sub(n as u64);
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        self.inner.get_frame(n).await
    }
}

/// Clip of `count` frames whose luma ramps with the index
pub fn ramp_clip(format: VideoFormat, width: u32, height: u32, count: u32) -> MemorySource {
    let frames = (0..count)
        .map(|i| Frame::filled(format, width, height, [16 + i as u16, 128, 128]))
        .collect();
    MemorySource::with_info(VideoInfo::new(format, width, height, count), frames)
}

pub fn recorder() -> Arc<Mutex<Recorder>> {
    Arc::new(Mutex::new(Recorder::default()))
}
