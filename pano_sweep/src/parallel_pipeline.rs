// THEORY:
// Selection and segmentation are inherently sequential: every continuity
// decision depends on the frame just before it. Once the segment boundaries
// are fixed, though, each segment's cascade reads only its own frames and
// writes only its own result, so the cascades can run side by side.
//
// `SegmentWorkerPool` is a fixed set of async workers fed round-robin by a
// single dispatcher. A worker moves its segment into `spawn_blocking`, because
// the cascade is pure CPU work, and answers on the task's oneshot channel.
// Results arrive in completion order and are parked in a reorder buffer keyed
// by segment index; they are released (and progress reported) strictly in
// segment order, so the output is identical to the sequential pipeline's.
//
// Cascades run under a child of the caller's token. When one segment errors,
// the child is cancelled and the pool is drained before the error is returned,
// so no cascade outlives the call that started it.

use crate::core_modules::cascade::AlignmentCascade;
use crate::core_modules::cascade::global::GlobalStitcher;
use crate::core_modules::frame::FrameSource;
use crate::core_modules::segmenter::Segment;
use crate::error::{PipelineError, Result};
use crate::pipeline::{
    CancelToken, PanoramaPipeline, PanoramaResult, PipelineConfig, ProgressSink, segment_progress,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub struct SegmentTask {
    pub segment: Segment,
    pub cancel: CancelToken,
    pub result_sender: oneshot::Sender<Result<PanoramaResult>>,
}

pub struct SegmentWorkerPool {
    task_sender: mpsc::UnboundedSender<SegmentTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl SegmentWorkerPool {
    /// Must be called from inside a tokio runtime.
    pub fn new(cascade: Arc<AlignmentCascade>, size: usize) -> Self {
        let size = size.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<SegmentTask>();
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| mpsc::unbounded_channel::<SegmentTask>())
            .unzip();

        // Single dispatcher, round-robin over the workers.
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                if worker_senders[worker_idx].send(task).is_err() {
                    warn!(worker = worker_idx, "worker channel closed, dropping task");
                }
                worker_idx = (worker_idx + 1) % size;
            }
        });

        let mut workers = Vec::with_capacity(size);
        for (worker_id, mut worker_receiver) in worker_receivers.into_iter().enumerate() {
            let worker_cascade = Arc::clone(&cascade);
            let worker = tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let result =
                        Self::process_segment_worker(worker_id, Arc::clone(&worker_cascade), task.segment, task.cancel)
                            .await;
                    let _ = task.result_sender.send(result);
                }
            });
            workers.push(worker);
        }

        Self { task_sender, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    async fn process_segment_worker(
        worker_id: usize,
        cascade: Arc<AlignmentCascade>,
        segment: Segment,
        cancel: CancelToken,
    ) -> Result<PanoramaResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let index = segment.index;
        debug!(worker = worker_id, segment = index, frames = segment.len(), "cascade started");
        tokio::task::spawn_blocking(move || {
            let output = cascade.run(&segment, &cancel)?;
            Ok(PanoramaResult::new(segment.index, segment.frame_indices(), output))
        })
        .await
        .map_err(|e| PipelineError::Worker(format!("segment {index}: {e}")))?
    }

    /// Queues `segment` and returns the channel its result will arrive on.
    pub fn submit(
        &self,
        segment: Segment,
        cancel: CancelToken,
    ) -> Result<oneshot::Receiver<Result<PanoramaResult>>> {
        let (result_sender, result_receiver) = oneshot::channel();
        let task = SegmentTask {
            segment,
            cancel,
            result_sender,
        };
        self.task_sender
            .send(task)
            .map_err(|_| PipelineError::Worker("failed to send task to worker pool".into()))?;
        Ok(result_receiver)
    }

    pub async fn process_segment(&self, segment: Segment, cancel: CancelToken) -> Result<PanoramaResult> {
        let receiver = self.submit(segment, cancel)?;
        receiver
            .await
            .map_err(|_| PipelineError::Worker("failed to receive result from worker".into()))?
    }

    /// Stops accepting work and waits for queued segments to finish.
    pub async fn shutdown(self) {
        drop(self.task_sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "segment worker ended abnormally");
            }
        }
    }
}

/// Panorama pipeline with the per-segment cascades spread over a worker pool.
pub struct ParallelPanoramaPipeline {
    pipeline: PanoramaPipeline,
    workers: usize,
}

impl ParallelPanoramaPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Ok(Self::from_pipeline(PanoramaPipeline::new(config)?))
    }

    pub fn with_global_stitcher(config: PipelineConfig, stitcher: Arc<dyn GlobalStitcher>) -> Result<Self> {
        Ok(Self::from_pipeline(PanoramaPipeline::with_global_stitcher(config, stitcher)?))
    }

    pub fn from_pipeline(pipeline: PanoramaPipeline) -> Self {
        let workers = pipeline.config().worker_threads.unwrap_or_else(num_cpus::get).max(1);
        Self { pipeline, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Same contract as [`PanoramaPipeline::run`]. Selection and segmentation
    /// run on the calling task; cascades run on the worker pool.
    pub async fn run<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<PanoramaResult>> {
        let frames = self.pipeline.select_frames(source, progress, cancel)?;
        let segments = self.pipeline.segment_frames(frames, progress, cancel)?;
        let total = segments.len();

        let pool = SegmentWorkerPool::new(self.pipeline.cascade(), self.workers.min(total));
        info!(segments = total, workers = pool.size(), "dispatching cascades");

        let batch = cancel.child();
        let collected = Self::collect(&pool, segments, progress, &batch).await;
        if let Err(e) = &collected {
            warn!(error = %e, "segment failed, cancelling the remaining cascades");
            batch.cancel();
        }
        pool.shutdown().await;
        let ordered = collected?;

        if ordered.len() != total {
            return Err(PipelineError::Worker(format!(
                "expected {total} results, got {}",
                ordered.len()
            )));
        }
        info!(panoramas = ordered.len(), "pipeline complete");
        progress.report(100, "complete");
        Ok(ordered)
    }

    /// Submits every segment and gathers the results in segment order. Stops
    /// at the first error without waiting for the other segments.
    async fn collect(
        pool: &SegmentWorkerPool,
        segments: Vec<Segment>,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<PanoramaResult>> {
        let total = segments.len();
        let mut pending = FuturesUnordered::new();
        for segment in segments {
            let index = segment.index;
            let receiver = pool.submit(segment, cancel.clone())?;
            pending.push(async move { (index, receiver.await) });
        }

        let mut reorder: BTreeMap<usize, PanoramaResult> = BTreeMap::new();
        let mut ordered: Vec<PanoramaResult> = Vec::with_capacity(total);
        while let Some((index, received)) = pending.next().await {
            let result = received
                .map_err(|_| PipelineError::Worker(format!("segment {index}: result channel closed")))??;
            reorder.insert(index, result);

            while let Some(next) = reorder.remove(&ordered.len()) {
                ordered.push(next);
                progress.report(
                    segment_progress(ordered.len(), total),
                    &format!("segment {}/{} stitched", ordered.len(), total),
                );
            }
        }
        Ok(ordered)
    }
}
