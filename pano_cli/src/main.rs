//! pano_cli: extract one panorama per camera sweep from a video file.

mod manifest;
mod opencv_io;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use manifest::{Manifest, SegmentEntry};
use opencv_io::{OpenCvStitcher, VideoFileSource};
use pano_sweep::{
    CancelToken, ContinuityMethod, DegeneratePolicy, ExportFormat, GlobalStitcher, NoGlobalStitcher,
    PanoramaPipeline, PanoramaResult, ParallelPanoramaPipeline, PipelineConfig, PipelineError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ContinuityArg {
    Histogram,
    Homography,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Png,
    Jpeg,
}

#[derive(Parser)]
#[command(name = "pano_cli")]
#[command(about = "Turn a panned video into one stitched panorama per continuous camera sweep")]
#[command(version)]
struct Cli {
    /// Input video (anything OpenCV can decode: MP4, AVI, MOV, ...).
    input: PathBuf,

    /// Directory for the panoramas and manifest.json.
    #[arg(long, default_value = "panoramas")]
    out_dir: PathBuf,

    /// Keep every N-th decoded frame, starting with the first.
    #[arg(long, default_value_t = 30)]
    frame_interval: u64,

    /// Drop sampled frames whose Laplacian variance is below this.
    #[arg(long)]
    sharpness_threshold: Option<f64>,

    /// Test used to detect cuts between sweeps.
    #[arg(long, value_enum, default_value_t = ContinuityArg::Histogram)]
    continuity: ContinuityArg,

    /// Histogram test: Bhattacharyya distance that counts as a cut.
    #[arg(long, default_value_t = 0.15)]
    hist_diff: f64,

    /// Homography test: translation, as a fraction of the larger frame side, that counts as a cut.
    #[arg(long, default_value_t = 0.15)]
    homography_threshold: f64,

    /// Sweeps with fewer frames are dropped.
    #[arg(long, default_value_t = 2)]
    min_segment_frames: usize,

    /// Optical-flow mosaic skips frames whose mean flow exceeds this (pixels).
    #[arg(long, default_value_t = 8.0)]
    flow_mag_threshold: f64,

    /// Row count of each strip in the pushbroom fallback.
    #[arg(long, default_value_t = 10)]
    strip_height: u32,

    /// Concurrent segment workers (default: one per core).
    #[arg(long)]
    workers: Option<usize>,

    /// Process segments one at a time on the main thread.
    #[arg(long)]
    sequential: bool,

    /// Keep degenerate tier results instead of falling through to the next tier.
    #[arg(long)]
    accept_degenerate: bool,

    /// Skip OpenCV's global stitcher (tier A).
    #[arg(long)]
    no_global_stitch: bool,

    /// Output image format.
    #[arg(long, value_enum, default_value_t = FormatArg::Jpeg)]
    format: FormatArg,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 90)]
    jpeg_quality: u8,
}

impl Cli {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            frame_interval: self.frame_interval,
            sharpness_threshold: self.sharpness_threshold,
            continuity: match self.continuity {
                ContinuityArg::Histogram => ContinuityMethod::Histogram,
                ContinuityArg::Homography => ContinuityMethod::Homography,
            },
            segment_hist_diff: self.hist_diff,
            segment_homography_threshold: self.homography_threshold,
            min_segment_frames: self.min_segment_frames,
            flow_mag_threshold: self.flow_mag_threshold,
            strip_height: self.strip_height,
            degenerate_policy: if self.accept_degenerate {
                DegeneratePolicy::Accept
            } else {
                DegeneratePolicy::FallThrough
            },
            worker_threads: self.workers,
            ..PipelineConfig::default()
        }
    }

    fn format(&self) -> ExportFormat {
        match self.format {
            FormatArg::Png => ExportFormat::Png,
            FormatArg::Jpeg => ExportFormat::Jpeg {
                quality: self.jpeg_quality,
            },
        }
    }

    fn stitcher(&self) -> Arc<dyn GlobalStitcher> {
        if self.no_global_stitch {
            Arc::new(NoGlobalStitcher)
        } else {
            Arc::new(OpenCvStitcher)
        }
    }
}

async fn run_pipeline(cli: &Cli, cancel: &CancelToken) -> Result<Vec<PanoramaResult>, PipelineError> {
    let mut source = VideoFileSource::open(&cli.input)?;
    let progress = |percent: u8, stage: &str| info!(percent, stage, "progress");
    let pipeline = PanoramaPipeline::with_global_stitcher(cli.config(), cli.stitcher())?;
    if cli.sequential {
        pipeline.run(&mut source, &progress, cancel)
    } else {
        ParallelPanoramaPipeline::from_pipeline(pipeline)
            .run(&mut source, &progress, cancel)
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating output directory {}", cli.out_dir.display()))?;

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    let mut manifest = Manifest {
        input: cli.input.clone(),
        status: "ok".into(),
        segments: Vec::new(),
    };

    match run_pipeline(&cli, &cancel).await {
        Ok(results) => {
            let format = cli.format();
            for result in &results {
                let path = result
                    .save(&cli.out_dir, format)
                    .with_context(|| format!("writing panorama for segment {}", result.segment_index))?;
                info!(
                    segment = result.segment_index,
                    tier = %result.tier,
                    degenerate = result.degenerate,
                    path = %path.display(),
                    "panorama written"
                );
                manifest.segments.push(SegmentEntry::new(result, path));
            }
        }
        Err(e @ (PipelineError::InsufficientFrames { .. } | PipelineError::NoSegmentsFound { .. })) => {
            warn!("{e}");
            manifest.status = e.to_string();
        }
        Err(e) => return Err(e).context("panorama pipeline failed"),
    }

    let manifest_path = manifest.write(&cli.out_dir)?;
    info!(
        panoramas = manifest.segments.len(),
        manifest = %manifest_path.display(),
        "done"
    );
    Ok(())
}
