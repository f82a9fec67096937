//! Frame-pair ingestion
//!
//! `VmafFilter` turns frame requests into engine submissions:
//!
//! ```text
//!  get_frame(n) ──► reference[n] ─┐
//!                   distorted[n] ─┴─► alloc + copy ──► barrier(next == n) ──► engine.read_pictures(n)
//!                   (any order)       (parallel)       (watch channel)        (mutex)
//! ```
//!
//! Requests for different indices may run concurrently and complete in any
//! order. Picture preparation runs outside any lock; submission waits until
//! every lower index has been submitted, so the engine sees strictly
//! increasing indices with no gaps. A request waiting on a lower index that
//! nobody has asked for submits that index itself.
//!
//! The first frame that fails before reaching the engine aborts the stream
//! at its index: lower indices may still be submitted, that index and every
//! later one fail. Teardown (flush, pool, write report, destroy) runs exactly
//! once, from [`VmafFilter::finish`] or on drop.

use crate::config::{CoreInfo, FeatureRequest, ModelRequest, OutputFormat, VmafConfig};
use crate::engine::{
    CollectionScore, EngineConfig, Picture, PictureAllocator, PoolMethod, ScoringEngine,
};
use crate::error::{Error, Result, FILTER_NAME};
use crate::picture;
use crate::session::{EngineScope, LoadedModel, Session};
use crate::source::FrameSource;
use crate::types::{Frame, PixelFormat, Stats, VideoFormat, VideoInfo};

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Submission progress shared by all in-flight requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Gate {
    /// Next index the engine accepts
    next: u32,
    /// Lowest index that failed; it and everything after it are rejected
    aborted_at: Option<u32>,
    /// Teardown has started
    closed: bool,
}

impl Gate {
    fn blocks(&self, n: u32) -> bool {
        self.closed || self.aborted_at.is_some_and(|at| n >= at)
    }

    fn abort(&mut self, n: u32) {
        self.aborted_at = Some(self.aborted_at.map_or(n, |at| at.min(n)));
    }
}

/// Pooled score of one requested model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Standalone(f64),
    Collection(CollectionScore),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PooledScore {
    pub model: ModelRequest,
    pub score: Score,
}

/// Outcome of teardown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// Frame pairs the engine accepted
    pub frames_submitted: u32,
    /// Index processing was aborted at, if any
    pub aborted_at: Option<u32>,
    pub scores: Vec<PooledScore>,
    /// Non-fatal flush, pooling and report-writing failures
    pub failures: Vec<String>,
}

impl Report {
    /// Pooled score for a standalone model
    pub fn score(&self, model: ModelRequest) -> Option<f64> {
        self.scores.iter().find_map(|s| match s.score {
            Score::Standalone(v) if s.model == model => Some(v),
            _ => None,
        })
    }

    /// Pooled score for a model collection
    pub fn collection_score(&self, model: ModelRequest) -> Option<CollectionScore> {
        self.scores.iter().find_map(|s| match s.score {
            Score::Collection(v) if s.model == model => Some(v),
            _ => None,
        })
    }
}

/// Pass-through filter feeding frame pairs to a scoring engine
pub struct VmafFilter<E: ScoringEngine> {
    // Field order is drop order: engine before streams
    engine: Mutex<EngineScope<E>>,
    allocator: Arc<dyn PictureAllocator>,
    gate: watch::Sender<Gate>,
    /// Indices some request is working on
    claimed: Mutex<BTreeSet<u32>>,
    stats: Mutex<Stats>,
    report: OnceLock<Report>,
    reference: Arc<dyn FrameSource>,
    distorted: Arc<dyn FrameSource>,
    info: VideoInfo,
    format: VideoFormat,
    log_path: PathBuf,
    log_format: OutputFormat,
    features: Vec<FeatureRequest>,
    chroma: bool,
    pixel_format: PixelFormat,
}

impl<E: ScoringEngine> VmafFilter<E> {
    /// Validate, bring up the engine and return the filter
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
        Session::create(core, reference, distorted, config, init_engine).map(Self::new)
    }

    pub fn new(session: Session<E>) -> Self {
        let Session {
            scope,
            reference,
            distorted,
            info,
            format,
            log_path,
            log_format,
            features,
            chroma,
            pixel_format,
        } = session;

        let (gate, _) = watch::channel(Gate::default());
        let allocator = scope
            .engine()
            .map(|engine| engine.allocator())
            .unwrap_or_else(|| Arc::new(crate::engine::DefaultAllocator));

        Self {
            engine: Mutex::new(scope),
            allocator,
            gate,
            claimed: Mutex::new(BTreeSet::new()),
            stats: Mutex::new(Stats::default()),
            report: OnceLock::new(),
            reference,
            distorted,
            info,
            format,
            log_path,
            log_format,
            features,
            chroma,
            pixel_format,
        }
    }

    /// Output clip description (same as the reference clip)
    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn chroma(&self) -> bool {
        self.chroma
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn features(&self) -> &[FeatureRequest] {
        &self.features
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().clone()
    }

    /// Frames submitted so far
    pub fn frames_submitted(&self) -> u32 {
        self.gate.borrow().next
    }

    pub fn is_aborted(&self) -> bool {
        self.gate.borrow().aborted_at.is_some()
    }

    /// Produce output frame `n`: the reference frame, after the pair has
    /// been submitted to the engine
    pub async fn get_frame(&self, n: u32) -> Result<Frame> {
        if n >= self.info.num_frames {
            return Err(Error::Source(format!(
                "frame {} out of range ({} frames)",
                n, self.info.num_frames
            )));
        }
        self.stats.lock().frames_requested += 1;

        let claim = self.claim(n);
        let result = self.ingest(n).await;
        if let Err(e) = &result {
            self.abort_at(n, e);
        }
        drop(claim);
        result
    }

    /// Mark `n` as in flight. `None` when another request already owns it.
    fn claim(&self, n: u32) -> Option<Claim<'_, E>> {
        self.claimed
            .lock()
            .insert(n)
            .then(|| Claim { filter: self, n })
    }

    /// Abort the stream at `n` unless it is already submitted or aborted lower
    fn abort_at(&self, n: u32, e: &Error) {
        let first = {
            let mut first = false;
            self.gate.send_if_modified(|g| {
                if g.closed || n < g.next || g.aborted_at.is_some_and(|at| at <= n) {
                    return false;
                }
                first = true;
                g.abort(n);
                true
            });
            first
        };
        if first {
            tracing::error!("{}: aborting at frame {}: {}", FILTER_NAME, n, e.message());
        }
    }

    async fn fetch(&self, n: u32) -> Result<(Frame, Frame)> {
        tokio::try_join!(self.reference.get_frame(n), self.distorted.get_frame(n))
    }

    async fn ingest(&self, n: u32) -> Result<Frame> {
        // Awaiting inputs
        let (reference, distorted) = self.fetch(n).await?;

        let gate = *self.gate.borrow();
        if n < gate.next {
            tracing::trace!("Frame {} already submitted, passing through", n);
            return Ok(reference);
        }
        if gate.blocks(n) {
            return Err(self.blocked_error(&gate, n));
        }

        // Submitting
        let (ref_pic, dist_pic) = self.prepare(&reference, &distorted)?;
        drop(distorted);

        let mut rx = self.gate.subscribe();
        loop {
            let gate = *rx.borrow_and_update();
            if n < gate.next {
                return Ok(reference);
            }
            if gate.blocks(n) {
                return Err(self.blocked_error(&gate, n));
            }
            if gate.next == n {
                break;
            }
            // Nobody is working on the next index, so the barrier would never open
            match self.claim(gate.next) {
                Some(claim) => self.fill(claim).await,
                None => rx
                    .changed()
                    .await
                    .map_err(|_| Error::ingestion("submission gate closed"))?,
            }
        }

        self.submit(n, ref_pic, dist_pic)?;
        Ok(reference)
    }

    /// Submit a claimed lower index on behalf of a later request
    async fn fill(&self, claim: Claim<'_, E>) {
        tracing::debug!("Submitting frame {} ahead of a later request", claim.n);
        if let Err(e) = self.fill_frame(claim.n).await {
            self.abort_at(claim.n, &e);
        }
    }

    async fn fill_frame(&self, n: u32) -> Result<()> {
        let (reference, distorted) = self.fetch(n).await?;
        if n < self.gate.borrow().next {
            return Ok(());
        }
        let (ref_pic, dist_pic) = self.prepare(&reference, &distorted)?;
        self.submit(n, ref_pic, dist_pic)
    }

    /// Hand a prepared pair to the engine once `n` is the next index
    fn submit(&self, n: u32, ref_pic: Picture, dist_pic: Picture) -> Result<()> {
        {
            let mut scope = self.engine.lock();
            // Another request for the same index may have won the race
            let gate = *self.gate.borrow();
            if n < gate.next {
                return Ok(());
            }
            if gate.blocks(n) {
                return Err(self.blocked_error(&gate, n));
            }
            let engine = scope
                .engine_mut()
                .ok_or_else(|| Error::ingestion("VMAF context is closed"))?;
            engine
                .read_pictures(ref_pic, dist_pic, n)
                .map_err(|e| Error::ingestion(format!("failed to read pictures: {}", e.message())))?;
            self.gate.send_modify(|g| g.next = n + 1);
        }

        self.stats.lock().frames_submitted += 1;
        tracing::trace!("Submitted frame {}", n);
        Ok(())
    }

    fn blocked_error(&self, gate: &Gate, n: u32) -> Error {
        match gate.aborted_at {
            Some(at) if n >= at => Error::ingestion(format!(
                "frame {} not scored, processing aborted at frame {}",
                n, at
            )),
            _ => Error::ingestion(format!("frame {} requested after teardown", n)),
        }
    }

    /// Allocate both native pictures and copy the frames into them
    fn prepare(&self, reference: &Frame, distorted: &Frame) -> Result<(Picture, Picture)> {
        let bpc = self.format.bits_per_sample;
        let (w, h) = (self.info.width, self.info.height);
        let mut ref_pic = self.allocator.alloc_picture(self.pixel_format, bpc, w, h)?;
        let mut dist_pic = self.allocator.alloc_picture(self.pixel_format, bpc, w, h)?;

        let copied = picture::fill_picture(&mut ref_pic, reference, self.chroma)?
            + picture::fill_picture(&mut dist_pic, distorted, self.chroma)?;

        let mut stats = self.stats.lock();
        stats.luma_planes_copied += 2;
        stats.chroma_planes_copied += (copied as u64).saturating_sub(2);
        Ok((ref_pic, dist_pic))
    }

    /// Pull every frame through the filter with at most `concurrency`
    /// requests in flight. Returns the number of frames produced.
    pub async fn process_all(self: &Arc<Self>, concurrency: usize) -> Result<u32> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        // Permits are taken in index order, so the lowest pending index is
        // always in flight and the barrier cannot stall.
        for n in 0..self.info.num_frames {
            if self.is_aborted() {
                break;
            }
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::ingestion("request pool closed"))?;
            let filter = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                (n, filter.get_frame(n).await.map(drop))
            });
        }

        let mut produced = 0;
        let mut first_error: Option<(u32, Error)> = None;
        while let Some(joined) = tasks.join_next().await {
            let (n, result) =
                joined.map_err(|e| Error::ingestion(format!("frame task failed: {}", e)))?;
            match result {
                Ok(()) => produced += 1,
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(at, _)| n < *at) {
                        first_error = Some((n, e));
                    }
                }
            }
        }

        match first_error {
            Some((_, e)) => Err(e),
            None => Ok(produced),
        }
    }

    /// Flush, pool, write the report and destroy the engine. Runs once;
    /// later calls return the same report.
    pub fn finish(&self) -> &Report {
        self.report.get_or_init(|| self.teardown())
    }

    fn teardown(&self) -> Report {
        let mut scope = self.engine.lock();
        self.gate.send_modify(|g| g.closed = true);
        let gate = *self.gate.borrow();

        let mut report = Report {
            frames_submitted: gate.next,
            aborted_at: gate.aborted_at,
            ..Default::default()
        };
        let fail = |what: &str, e: Error| {
            tracing::error!("{}: {}: {}", FILTER_NAME, what, e.message());
            report_failure(what, &e)
        };
        let mut failures = Vec::new();

        if let Some((engine, models)) = scope.parts_mut() {
            if let Err(e) = engine.flush() {
                failures.push(fail("failed to flush context", e));
            }

            if gate.next == 0 {
                tracing::warn!("{}: no frames were scored, skipping pooling", FILTER_NAME);
            } else {
                let last = gate.next - 1;
                for loaded in models.iter() {
                    if let LoadedModel::Standalone { request, model } = loaded {
                        match engine.score_pooled(model, PoolMethod::Mean, 0, last) {
                            Ok(score) => {
                                tracing::info!("{} pooled mean: {:.6}", request.name(), score);
                                report.scores.push(PooledScore {
                                    model: *request,
                                    score: Score::Standalone(score),
                                });
                            }
                            Err(e) => failures.push(fail("failed to generate pooled VMAF score", e)),
                        }
                    }
                }
                for loaded in models.iter() {
                    if let LoadedModel::Collection {
                        request,
                        collection,
                    } = loaded
                    {
                        match engine.score_pooled_collection(collection, PoolMethod::Mean, 0, last) {
                            Ok(score) => {
                                tracing::info!(
                                    "{} pooled mean: {:.6} (95% CI {:.6}..{:.6})",
                                    request.name(),
                                    score.bagging,
                                    score.ci_p95_lo,
                                    score.ci_p95_hi
                                );
                                report.scores.push(PooledScore {
                                    model: *request,
                                    score: Score::Collection(score),
                                });
                            }
                            Err(e) => failures.push(fail("failed to generate pooled VMAF score", e)),
                        }
                    }
                }
            }

            if let Err(e) = engine.write_output(&self.log_path, self.log_format) {
                failures.push(fail("failed to write VMAF stats", e));
            } else {
                tracing::info!("VMAF stats written to {}", self.log_path.display());
            }
        }

        scope.destroy();
        report.failures = failures;
        report
    }
}

/// Ownership of an index; releasing it wakes requests waiting on the gate
struct Claim<'a, E: ScoringEngine> {
    filter: &'a VmafFilter<E>,
    n: u32,
}

impl<E: ScoringEngine> Drop for Claim<'_, E> {
    fn drop(&mut self) {
        self.filter.claimed.lock().remove(&self.n);
        self.filter.gate.send_modify(|_| ());
    }
}

fn report_failure(what: &str, e: &Error) -> String {
    format!("{}: {}", what, e.message())
}

impl<E: ScoringEngine> Drop for VmafFilter<E> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_blocks_after_abort() {
        let mut gate = Gate::default();
        assert!(!gate.blocks(0));
        gate.abort(5);
        assert!(!gate.blocks(4));
        assert!(gate.blocks(5));
        assert!(gate.blocks(9));
        gate.abort(7);
        assert_eq!(gate.aborted_at, Some(5));
        gate.abort(2);
        assert_eq!(gate.aborted_at, Some(2));
    }

    #[test]
    fn test_gate_blocks_when_closed() {
        let gate = Gate {
            closed: true,
            ..Default::default()
        };
        assert!(gate.blocks(0));
    }
}
