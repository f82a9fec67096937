//! Scoring engine backed by the standalone `vmaf` tool
//!
//! Submitted pictures are spooled into a reference and a distorted file on a
//! dedicated writer thread: Y4M where the bit depth allows it, raw planar
//! YUV otherwise. Pooling and report writing invoke the `vmaf` executable on
//! those files:
//! - pooled scores come from its JSON output (run once, cached)
//! - XML, CSV and subtitle reports are produced by a second run

use super::{
    CollectionScore, EngineConfig, ModelConfig, Picture, PoolMethod, ScoringEngine,
};
use crate::config::{AcceleratorConfig, OutputFormat};
use crate::error::{Error, Result, FILTER_NAME};
use crate::types::PixelFormat;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Models the tool only exposes as bootstrapped collections
const COLLECTION_ONLY: &[&str] = &["vmaf_b_v0.6.3"];

/// Environment variable overriding the executable path
pub const VMAF_BIN_ENV: &str = "VMAF_BIN";

/// Check if the `vmaf` executable can be run
pub fn is_available() -> bool {
    Command::new(default_binary())
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn default_binary() -> PathBuf {
    std::env::var_os(VMAF_BIN_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vmaf"))
}

/// Standalone model registered with the tool
#[derive(Debug, Clone)]
pub struct ToolModel {
    config: ModelConfig,
}

/// Bootstrapped model collection registered with the tool
#[derive(Debug, Clone)]
pub struct ToolCollection {
    config: ModelConfig,
}

/// Accelerator state; the tool engine cannot create one
#[derive(Debug)]
pub enum NoAccelerator {}

type PicturePair = (Picture, Picture);

/// Picture layout of the spool files, fixed by the first submission
#[derive(Debug, Clone, Copy)]
struct SpoolLayout {
    width: u32,
    height: u32,
    pix_fmt: PixelFormat,
    bpc: u32,
    /// `None` spools raw planar YUV
    colorspace: Option<y4m::Colorspace>,
}

impl SpoolLayout {
    fn of(pic: &Picture) -> Self {
        Self {
            width: pic.width,
            height: pic.height,
            pix_fmt: pic.pix_fmt,
            bpc: pic.bpc,
            colorspace: colorspace_for(pic.pix_fmt, pic.bpc),
        }
    }

    fn extension(&self) -> &'static str {
        if self.colorspace.is_some() {
            "y4m"
        } else {
            "yuv"
        }
    }

    fn check(&self, pic: &Picture) -> Result<()> {
        if (pic.width, pic.height, pic.pix_fmt, pic.bpc)
            != (self.width, self.height, self.pix_fmt, self.bpc)
        {
            return Err(Error::ingestion(format!(
                "picture {}x{} {} {}-bit does not match spool layout {}x{} {} {}-bit",
                pic.width, pic.height, pic.pix_fmt, pic.bpc, self.width, self.height,
                self.pix_fmt, self.bpc
            )));
        }
        Ok(())
    }
}

struct Spooler {
    tx: crossbeam_channel::Sender<PicturePair>,
    handle: std::thread::JoinHandle<Result<()>>,
}

/// Engine context driving the `vmaf` executable
pub struct ToolEngine {
    config: EngineConfig,
    binary: PathBuf,
    workdir: tempfile::TempDir,
    models: Vec<ModelConfig>,
    features: Vec<String>,
    spooler: Option<Spooler>,
    layout: Option<SpoolLayout>,
    next_index: u32,
    flushed: bool,
    scores: Option<serde_json::Value>,
}

impl ToolEngine {
    /// Create an engine context using `$VMAF_BIN` or `vmaf` from `PATH`
    pub fn init(config: EngineConfig) -> Result<Self> {
        Self::with_binary(config, default_binary())
    }

    /// Create an engine context using a specific executable
    pub fn with_binary(config: EngineConfig, binary: impl Into<PathBuf>) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("vmafbridge-")
            .tempdir()
            .map_err(|e| Error::config(format!("failed to initialize VMAF context: {}", e)))?;

        tracing::debug!(
            "vmaf tool context: {} threads, subsample {}, spool dir {}",
            config.n_threads,
            config.n_subsample,
            workdir.path().display()
        );

        Ok(Self {
            config,
            binary: binary.into(),
            workdir,
            models: Vec::new(),
            features: Vec::new(),
            spooler: None,
            layout: None,
            next_index: 0,
            flushed: false,
            scores: None,
        })
    }

    /// Frames accepted so far
    pub fn frames_submitted(&self) -> u32 {
        self.next_index
    }

    fn spool_extension(&self) -> &'static str {
        self.layout.map_or("y4m", |l| l.extension())
    }

    fn reference_path(&self) -> PathBuf {
        self.workdir
            .path()
            .join(format!("reference.{}", self.spool_extension()))
    }

    fn distorted_path(&self) -> PathBuf {
        self.workdir
            .path()
            .join(format!("distorted.{}", self.spool_extension()))
    }

    fn start_spooler(&self, layout: SpoolLayout) -> Result<Spooler> {
        if layout.colorspace.is_none() {
            tracing::debug!(
                "{}-bit {} has no Y4M colorspace, spooling raw YUV",
                layout.bpc,
                layout.pix_fmt
            );
        }
        let reference = BufWriter::new(File::create(self.reference_path())?);
        let distorted = BufWriter::new(File::create(self.distorted_path())?);

        let (tx, rx) = crossbeam_channel::bounded::<PicturePair>(4);
        let handle = std::thread::Builder::new()
            .name("vmaf-spool".into())
            .spawn(move || -> Result<()> {
                spool(reference, distorted, rx, layout)?;
                tracing::debug!("Spool thread finished");
                Ok(())
            })?;

        Ok(Spooler { tx, handle })
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--reference")
            .arg(self.reference_path())
            .arg("--distorted")
            .arg(self.distorted_path())
            .arg("--threads")
            .arg(self.config.n_threads.to_string())
            .arg("--subsample")
            .arg(self.config.n_subsample.to_string())
            .arg("--quiet");
        if let Some(layout) = self.layout.filter(|l| l.colorspace.is_none()) {
            cmd.arg("--width")
                .arg(layout.width.to_string())
                .arg("--height")
                .arg(layout.height.to_string())
                .arg("--pixel_format")
                .arg(raw_pixel_format(layout.pix_fmt))
                .arg("--bitdepth")
                .arg(layout.bpc.to_string());
        }
        if self.config.cpumask != 0 {
            cmd.arg("--cpumask").arg(self.config.cpumask.to_string());
        }
        if self.models.is_empty() {
            cmd.arg("--no_prediction");
        }
        for model in &self.models {
            cmd.arg("--model")
                .arg(format!("version={}:name={}", model.version, model.name));
        }
        for feature in &self.features {
            cmd.arg("--feature").arg(feature);
        }
        cmd
    }

    fn run(&self, output: &Path, format: OutputFormat) -> Result<()> {
        if !self.flushed {
            return Err(Error::reporting("context has not been flushed"));
        }
        if self.next_index == 0 {
            return Err(Error::reporting("no frames were submitted"));
        }

        let flag = match format {
            OutputFormat::Xml => "--xml",
            OutputFormat::Json => "--json",
            OutputFormat::Csv => "--csv",
            OutputFormat::Subtitle => "--sub",
        };

        let mut cmd = self.base_command();
        cmd.arg("--output").arg(output).arg(flag);
        tracing::debug!("Running {:?}", cmd);

        let out = cmd
            .output()
            .map_err(|e| Error::reporting(format!("failed to run {}: {}", self.binary.display(), e)))?;
        if !out.status.success() {
            return Err(Error::reporting(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    fn json_path(&self) -> PathBuf {
        self.workdir.path().join("scores.json")
    }

    fn scores(&mut self) -> Result<&serde_json::Value> {
        if self.scores.is_none() {
            let path = self.json_path();
            self.run(&path, OutputFormat::Json)?;
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::reporting(format!("failed to read VMAF stats: {}", e)))?;
            let value = serde_json::from_str(&text)
                .map_err(|e| Error::reporting(format!("failed to parse VMAF stats: {}", e)))?;
            self.scores = Some(value);
        }
        self.scores
            .as_ref()
            .ok_or_else(|| Error::reporting("no VMAF stats"))
    }

    fn pool_metric(&mut self, metric: &str, method: PoolMethod, first: u32, last: u32) -> Result<f64> {
        // The tool only scores every n-th frame
        let step = self.config.n_subsample.max(1);
        let expected = (first..=last).filter(|n| n % step == 0).count();
        let scores = self.scores()?;
        let series = metric_series(scores, metric, first, last);
        if series.len() != expected {
            return Err(Error::reporting(format!(
                "{} scores missing for {} of {} frames in {}..={}",
                metric,
                expected.saturating_sub(series.len()),
                expected,
                first,
                last
            )));
        }
        method.pool(&series).ok_or_else(|| {
            Error::reporting(format!(
                "no {} scores for frames {}..={}",
                metric, first, last
            ))
        })
    }
}

/// Per-frame values of `metric` for frames `first..=last`
fn metric_series(scores: &serde_json::Value, metric: &str, first: u32, last: u32) -> Vec<f64> {
    scores
        .get("frames")
        .and_then(|f| f.as_array())
        .map(|frames| {
            frames
                .iter()
                .filter(|f| {
                    f.get("frameNum")
                        .and_then(|n| n.as_u64())
                        .is_some_and(|n| n >= first as u64 && n <= last as u64)
                })
                .filter_map(|f| f.get("metrics")?.get(metric)?.as_f64())
                .collect()
        })
        .unwrap_or_default()
}

/// Y4M colorspace for a picture layout; the format has none for 16-bit
fn colorspace_for(pix_fmt: PixelFormat, bpc: u32) -> Option<y4m::Colorspace> {
    use y4m::Colorspace as C;
    let cs = match (pix_fmt, bpc) {
        (PixelFormat::Yuv420p, 8) => C::C420,
        (PixelFormat::Yuv422p, 8) => C::C422,
        (PixelFormat::Yuv444p, 8) => C::C444,
        (PixelFormat::Yuv420p, 10) => C::C420p10,
        (PixelFormat::Yuv422p, 10) => C::C422p10,
        (PixelFormat::Yuv444p, 10) => C::C444p10,
        (PixelFormat::Yuv420p, 12) => C::C420p12,
        (PixelFormat::Yuv422p, 12) => C::C422p12,
        (PixelFormat::Yuv444p, 12) => C::C444p12,
        _ => return None,
    };
    Some(cs)
}

/// `--pixel_format` value for raw input
fn raw_pixel_format(pix_fmt: PixelFormat) -> &'static str {
    match pix_fmt {
        PixelFormat::Yuv420p => "420",
        PixelFormat::Yuv422p => "422",
        PixelFormat::Yuv444p => "444",
    }
}

fn spool_error(e: impl std::fmt::Debug) -> Error {
    Error::ingestion(format!("failed to spool picture: {:?}", e))
}

/// Write every received pair, then flush both files
fn spool<W: Write>(
    mut reference: W,
    mut distorted: W,
    rx: crossbeam_channel::Receiver<PicturePair>,
    layout: SpoolLayout,
) -> Result<()> {
    match layout.colorspace {
        Some(colorspace) => {
            let mut ref_enc = y4m_encoder(&mut reference, &layout, colorspace)?;
            let mut dist_enc = y4m_encoder(&mut distorted, &layout, colorspace)?;
            for (r, d) in rx.iter() {
                write_y4m(&mut ref_enc, &layout, &r)?;
                write_y4m(&mut dist_enc, &layout, &d)?;
            }
        }
        None => {
            for (r, d) in rx.iter() {
                write_raw(&mut reference, &layout, &r)?;
                write_raw(&mut distorted, &layout, &d)?;
            }
        }
    }
    reference
        .flush()
        .and_then(|()| distorted.flush())
        .map_err(|e| Error::ingestion(format!("failed to flush spool file: {}", e)))
}

fn y4m_encoder<W: Write>(
    w: W,
    layout: &SpoolLayout,
    colorspace: y4m::Colorspace,
) -> Result<y4m::Encoder<W>> {
    y4m::encode(layout.width as usize, layout.height as usize, y4m::Ratio::new(25, 1))
        .with_colorspace(colorspace)
        .write_header(w)
        .map_err(|e| Error::ingestion(format!("failed to write Y4M header: {:?}", e)))
}

fn write_y4m<W: Write>(enc: &mut y4m::Encoder<W>, layout: &SpoolLayout, pic: &Picture) -> Result<()> {
    layout.check(pic)?;
    let planes = [pic.packed_plane(0), pic.packed_plane(1), pic.packed_plane(2)];
    let frame = y4m::Frame::new(
        [planes[0].as_slice(), planes[1].as_slice(), planes[2].as_slice()],
        None,
    );
    enc.write_frame(&frame).map_err(spool_error)
}

fn write_raw<W: Write>(w: &mut W, layout: &SpoolLayout, pic: &Picture) -> Result<()> {
    layout.check(pic)?;
    for plane in 0..3 {
        w.write_all(&pic.packed_plane(plane)).map_err(spool_error)?;
    }
    Ok(())
}

impl ScoringEngine for ToolEngine {
    type Model = ToolModel;
    type Collection = ToolCollection;
    type AcceleratorState = NoAccelerator;

    fn init_accelerator(&mut self, _config: &AcceleratorConfig) -> Result<NoAccelerator> {
        Err(Error::config(
            "problem during accelerator state init: the vmaf tool engine has no accelerator path",
        ))
    }

    fn import_accelerator(&mut self, state: NoAccelerator) -> Result<()> {
        match state {}
    }

    fn model_load(&mut self, config: &ModelConfig) -> Result<ToolModel> {
        if COLLECTION_ONLY.contains(&config.version.as_str()) {
            return Err(Error::config(format!(
                "{} is only available as a model collection",
                config.version
            )));
        }
        Ok(ToolModel {
            config: config.clone(),
        })
    }

    fn model_collection_load(&mut self, config: &ModelConfig) -> Result<ToolCollection> {
        if !COLLECTION_ONLY.contains(&config.version.as_str()) {
            return Err(Error::config(format!(
                "no model collection named {}",
                config.version
            )));
        }
        Ok(ToolCollection {
            config: config.clone(),
        })
    }

    fn use_features_from_model(&mut self, model: &ToolModel) -> Result<()> {
        self.models.push(model.config.clone());
        Ok(())
    }

    fn use_features_from_collection(&mut self, collection: &ToolCollection) -> Result<()> {
        self.models.push(collection.config.clone());
        Ok(())
    }

    fn use_feature(&mut self, name: &str) -> Result<()> {
        if self.features.iter().any(|f| f == name) {
            return Err(Error::config(format!("feature {} already registered", name)));
        }
        self.features.push(name.to_string());
        Ok(())
    }

    fn read_pictures(&mut self, reference: Picture, distorted: Picture, index: u32) -> Result<()> {
        if self.flushed {
            return Err(Error::ingestion("context already flushed"));
        }
        if index != self.next_index {
            return Err(Error::ingestion(format!(
                "frame {} submitted out of order, expected {}",
                index, self.next_index
            )));
        }
        if self.spooler.is_none() {
            let layout = SpoolLayout::of(&reference);
            self.layout = Some(layout);
            self.spooler = Some(self.start_spooler(layout)?);
        }
        let spooler = self
            .spooler
            .as_ref()
            .ok_or_else(|| Error::ingestion("spool thread not running"))?;
        spooler
            .tx
            .send((reference, distorted))
            .map_err(|_| Error::ingestion("spool thread stopped"))?;
        self.next_index += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        match self.spooler.take() {
            Some(Spooler { tx, handle }) => {
                drop(tx);
                handle
                    .join()
                    .map_err(|_| Error::reporting("spool thread panicked"))?
                    .map_err(|e| Error::reporting(e.message()))
            }
            None => Ok(()),
        }
    }

    fn score_pooled(
        &mut self,
        model: &ToolModel,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<f64> {
        let name = model.config.name.clone();
        self.pool_metric(&name, method, first, last)
    }

    fn score_pooled_collection(
        &mut self,
        collection: &ToolCollection,
        method: PoolMethod,
        first: u32,
        last: u32,
    ) -> Result<CollectionScore> {
        let name = collection.config.name.clone();
        Ok(CollectionScore {
            bagging: self.pool_metric(&format!("{}_bagging", name), method, first, last)?,
            stddev: self.pool_metric(&format!("{}_stddev", name), method, first, last)?,
            ci_p95_lo: self.pool_metric(&format!("{}_ci_p95_lo", name), method, first, last)?,
            ci_p95_hi: self.pool_metric(&format!("{}_ci_p95_hi", name), method, first, last)?,
        })
    }

    fn write_output(&mut self, path: &Path, format: OutputFormat) -> Result<()> {
        if format == OutputFormat::Json && self.scores.is_some() {
            std::fs::copy(self.json_path(), path)
                .map_err(|e| Error::reporting(format!("failed to write VMAF stats: {}", e)))?;
            return Ok(());
        }
        self.run(path, format)
    }

    fn close(mut self) {
        // Joins the spool thread if the stream was never flushed
        if let Err(e) = self.flush() {
            tracing::error!("{}: failed to flush context: {}", FILTER_NAME, e.message());
        }
    }
}
