// THEORY:
// This file is the entry point of the `pano_sweep` library crate. It turns a
// video of a panned scene into one panorama per continuous camera sweep:
//
//   1. frames are sampled (and optionally sharpness-gated) from a `FrameSource`,
//   2. the sample is split into segments wherever a continuity test sees a cut,
//   3. each segment runs through an alignment cascade (global stitch, homography
//      chain, optical-flow mosaic, pushbroom strips) until one tier succeeds.
//
// `PanoramaPipeline` runs the cascades one after another on the calling
// thread; `ParallelPanoramaPipeline` spreads them over a tokio worker pool and
// returns the same results in the same order. The stage modules under
// `core_modules` are public for callers that want to drive stages by hand or
// plug in their own continuity test or stitch strategy.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::cascade::global::{GlobalStitcher, NoGlobalStitcher};
pub use core_modules::cascade::{
    AlignmentCascade, AttemptKind, AttemptSummary, StitchAttemptResult, StitchStrategy, TierId, TierOutcome,
};
pub use core_modules::continuity::{ContinuityTest, ContinuityVerdict};
pub use core_modules::export::ExportFormat;
pub use core_modules::frame::{Frame, FrameSequence, FrameSource, VecFrameSource};
pub use core_modules::optical_flow::FlowParams;
pub use core_modules::segmenter::Segment;
pub use error::{PipelineError, Result};
pub use parallel_pipeline::{ParallelPanoramaPipeline, SegmentWorkerPool};
pub use pipeline::{
    CancelToken, ContinuityMethod, DegeneratePolicy, NoProgress, PanoramaPipeline, PanoramaResult, PipelineConfig,
    ProgressSink,
};
