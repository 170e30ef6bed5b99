mod common;

use common::synthetic::{block_world, flat, gradient, pan, repeat_each};
use image::RgbImage;
use pano_sweep::core_modules::cascade::global::GlobalStitchTier;
use pano_sweep::core_modules::cascade::homography_chain::HomographyChainTier;
use pano_sweep::core_modules::export;
use pano_sweep::core_modules::features::PairAlignParams;
use pano_sweep::{
    AlignmentCascade, AttemptKind, CancelToken, ContinuityMethod, DegeneratePolicy, ExportFormat, GlobalStitcher,
    NoGlobalStitcher, NoProgress, PanoramaPipeline, PanoramaResult, PipelineConfig, PipelineError, Result, Segment,
    StitchAttemptResult, StitchStrategy, TierId, VecFrameSource,
};
use std::sync::{Arc, Mutex};

/// A strategy that always reports failure for its tier.
struct Forced(TierId);

impl StitchStrategy for Forced {
    fn tier(&self) -> TierId {
        self.0
    }

    fn attempt(&self, _segment: &Segment, _cancel: &CancelToken) -> Result<StitchAttemptResult> {
        Ok(StitchAttemptResult::failed(self.0, "forced failure"))
    }
}

struct RejectingStitcher;

impl GlobalStitcher for RejectingStitcher {
    fn stitch(&self, _frames: &[&RgbImage]) -> std::result::Result<RgbImage, String> {
        Err("camera parameters adjustment failed".into())
    }
}

/// Lays the frames out left to right; stands in for a real global stitcher.
struct Concatenating;

impl GlobalStitcher for Concatenating {
    fn stitch(&self, frames: &[&RgbImage]) -> std::result::Result<RgbImage, String> {
        let width = frames.iter().map(|f| f.width()).sum();
        let height = frames.iter().map(|f| f.height()).max().unwrap_or(0);
        let mut out = RgbImage::new(width, height);
        let mut x = 0i64;
        for frame in frames {
            image::imageops::replace(&mut out, *frame, x, 0);
            x += frame.width() as i64;
        }
        Ok(out)
    }
}

fn every_frame() -> PipelineConfig {
    PipelineConfig {
        frame_interval: 1,
        ..PipelineConfig::default()
    }
}

fn run(config: PipelineConfig, frames: Vec<RgbImage>) -> Result<Vec<PanoramaResult>> {
    let pipeline = PanoramaPipeline::new(config)?;
    pipeline.run(&mut VecFrameSource::new(frames), &NoProgress, &CancelToken::new())
}

fn forced_to_d(config: &PipelineConfig) -> AlignmentCascade {
    let tiers: Vec<Box<dyn StitchStrategy>> = vec![
        Box::new(Forced(TierId::A)),
        Box::new(Forced(TierId::B)),
        Box::new(Forced(TierId::C)),
    ];
    AlignmentCascade::new(tiers, config.strip_height, config.degenerate_policy)
}

/// Four visually distinct scenes, each held for a given number of frames.
fn scenes(lengths: &[usize]) -> Vec<RgbImage> {
    let values = [20u8, 100, 180, 240];
    lengths
        .iter()
        .zip(values)
        .flat_map(|(&n, v)| repeat_each(&[flat(48, 36, v)], n))
        .collect()
}

#[test]
fn too_few_frames_is_insufficient() {
    let err = run(PipelineConfig::default(), vec![flat(32, 24, 50)]).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InsufficientFrames { selected: 1, required: 2 }
    ));
}

#[test]
fn blurry_video_is_insufficient() {
    let config = PipelineConfig {
        sharpness_threshold: Some(50.0),
        ..every_frame()
    };
    let err = run(config, repeat_each(&[flat(32, 24, 90)], 6)).unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientFrames { selected: 0, .. }));
}

#[test]
fn short_runs_never_become_segments() {
    // Scenes of 2, 1, 3 and 1 frames: the singletons are dropped, not merged.
    let results = run(every_frame(), scenes(&[2, 1, 3, 1])).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].frame_indices, vec![0, 1]);
    assert_eq!(results[1].frame_indices, vec![3, 4, 5]);
    assert!(results.iter().all(|r| r.frame_indices.len() >= 2));
    let indices: Vec<usize> = results.iter().map(|r| r.segment_index).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[test]
fn higher_minimum_drops_more() {
    let config = PipelineConfig {
        min_segment_frames: 3,
        ..every_frame()
    };
    let results = run(config, scenes(&[2, 1, 3, 4])).unwrap();
    let frames: Vec<Vec<u64>> = results.iter().map(|r| r.frame_indices.clone()).collect();
    assert_eq!(frames, vec![vec![3, 4, 5], vec![6, 7, 8, 9]]);
}

#[test]
fn segmentation_is_deterministic() {
    let frames = scenes(&[3, 2, 1, 4]);
    let a = run(every_frame(), frames.clone()).unwrap();
    let b = run(every_frame(), frames).unwrap();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.frame_indices, y.frame_indices);
        assert_eq!(x.tier, y.tier);
        assert_eq!(x.image, y.image);
    }
}

#[test]
fn failing_global_stitch_never_yields_tier_a() {
    let pipeline =
        PanoramaPipeline::with_global_stitcher(every_frame(), Arc::new(RejectingStitcher)).unwrap();
    let results = pipeline
        .run(
            &mut VecFrameSource::new(scenes(&[3, 3])),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_ne!(result.tier, TierId::A);
        assert_eq!(result.attempts[0].tier, TierId::A);
        assert_eq!(result.attempts[0].kind, AttemptKind::Failed);
        assert_eq!(
            result.attempts[0].reason.as_deref(),
            Some("camera parameters adjustment failed")
        );
    }
}

#[test]
fn working_global_stitch_wins() {
    let pipeline = PanoramaPipeline::with_global_stitcher(every_frame(), Arc::new(Concatenating)).unwrap();
    let results = pipeline
        .run(
            &mut VecFrameSource::new(scenes(&[3])),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tier, TierId::A);
    assert_eq!(results[0].image.dimensions(), (48 * 3, 36));
    assert_eq!(results[0].attempts.len(), 1);
}

#[test]
fn forced_failures_always_end_in_pushbroom() {
    let config = PipelineConfig {
        strip_height: 7,
        ..every_frame()
    };
    let pipeline = PanoramaPipeline::with_cascade(config.clone(), forced_to_d(&config)).unwrap();
    let frames = repeat_each(&[block_world(100, 80, 8, 11)], 5);
    let results = pipeline
        .run(&mut VecFrameSource::new(frames), &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.tier, TierId::D);
    assert!(!result.degenerate);
    let tiers: Vec<TierId> = result.attempts.iter().map(|a| a.tier).collect();
    assert_eq!(tiers, vec![TierId::A, TierId::B, TierId::C, TierId::D]);
    // N x s rows, W columns.
    assert_eq!(result.image.dimensions(), (100, 5 * 7));
}

#[test]
fn static_scene_forms_one_segment() {
    // One unchanging view for 150 decoded frames, sampled every 30.
    let config = PipelineConfig::default();
    let frames = repeat_each(&[flat(64, 48, 128)], 150);
    let results = run(config, frames).unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.frame_indices, vec![0, 30, 60, 90, 120]);

    // No global stitcher, no features to match, zero flow to blend along.
    let kinds: Vec<(TierId, AttemptKind)> = result.attempts.iter().map(|a| (a.tier, a.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (TierId::A, AttemptKind::Failed),
            (TierId::B, AttemptKind::Degenerate),
            (TierId::C, AttemptKind::Degenerate),
            (TierId::D, AttemptKind::Success),
        ]
    );
    assert_eq!(result.tier, TierId::D);
    assert!(!result.degenerate);
    assert_eq!(result.image.dimensions(), (64, 5 * 10));
}

#[test]
fn textured_static_scene_is_not_a_panorama() {
    // Plenty of features, so B aligns every frame, but only by the identity.
    let config = PipelineConfig::default();
    let frames = repeat_each(&[block_world(96, 72, 8, 5)], 150);
    let results = run(config, frames).unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];

    let kinds: Vec<(TierId, AttemptKind)> = result.attempts.iter().map(|a| (a.tier, a.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (TierId::A, AttemptKind::Failed),
            (TierId::B, AttemptKind::Degenerate),
            (TierId::C, AttemptKind::Degenerate),
            (TierId::D, AttemptKind::Success),
        ]
    );
    assert_eq!(result.tier, TierId::D);
    assert!(!result.degenerate);
    assert_eq!(result.image.dimensions(), (96, 5 * 10));
}

#[test]
fn static_scene_without_flow_tier_falls_to_pushbroom() {
    let config = PipelineConfig::default();
    let tiers: Vec<Box<dyn StitchStrategy>> = vec![
        Box::new(GlobalStitchTier::new(Arc::new(NoGlobalStitcher))),
        Box::new(HomographyChainTier::new(PairAlignParams::default())),
    ];
    let cascade = AlignmentCascade::new(tiers, config.strip_height, config.degenerate_policy);
    let pipeline = PanoramaPipeline::with_cascade(config.clone(), cascade).unwrap();
    let frames = repeat_each(&[flat(64, 48, 128)], 150);
    let results = pipeline
        .run(&mut VecFrameSource::new(frames), &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tier, TierId::D);
    assert_eq!(results[0].image.dimensions(), (64, 5 * config.strip_height));
}

#[test]
fn accepted_degenerate_result_is_flagged() {
    let config = PipelineConfig {
        degenerate_policy: DegeneratePolicy::Accept,
        ..every_frame()
    };
    let results = run(config, scenes(&[4])).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tier, TierId::B);
    assert!(results[0].degenerate);
    assert_eq!(results[0].attempts.last().map(|a| a.kind), Some(AttemptKind::Degenerate));
}

#[test]
fn large_pan_cuts_every_boundary() {
    // Frames move by half their larger dimension; the homography test cuts
    // every pair, leaving only singletons.
    let (width, height) = (200u32, 150u32);
    let step = width.max(height) / 2;
    let world = block_world(width + 3 * step, height, 8, 42);
    let frames = pan(&world, width, height, step, 4);
    let config = PipelineConfig {
        continuity: ContinuityMethod::Homography,
        ..every_frame()
    };
    let err = run(config, frames).unwrap_err();
    assert!(matches!(err, PipelineError::NoSegmentsFound { frames: 4 }));
}

#[test]
fn small_pan_stays_one_segment() {
    let world = block_world(240, 150, 8, 42);
    let frames = pan(&world, 200, 150, 4, 4);
    let config = PipelineConfig {
        continuity: ContinuityMethod::Homography,
        ..every_frame()
    };
    let results = run(config, frames).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].frame_indices, vec![0, 1, 2, 3]);
}

#[test]
fn png_export_round_trips() {
    let results = run(every_frame(), repeat_each(&[block_world(64, 48, 8, 3)], 3)).unwrap();
    let bytes = results[0].encode(ExportFormat::Png).unwrap();
    assert_eq!(export::decode(&bytes).unwrap(), results[0].image);
}

#[test]
fn jpeg_export_is_close() {
    let results = run(every_frame(), repeat_each(&[gradient(96, 64)], 3)).unwrap();
    let bytes = results[0].encode(ExportFormat::Jpeg { quality: 95 }).unwrap();
    let decoded = export::decode(&bytes).unwrap();
    assert_eq!(decoded.dimensions(), results[0].image.dimensions());
    assert!(export::psnr(&results[0].image, &decoded) > 30.0);
}

#[test]
fn save_writes_named_file() {
    let results = run(every_frame(), scenes(&[2])).unwrap();
    let dir = std::env::temp_dir().join("pano_sweep_save_test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = results[0].save(&dir, ExportFormat::Png).unwrap();
    assert!(path.ends_with(results[0].file_name(ExportFormat::Png)));
    assert_eq!(image::open(&path).unwrap().to_rgb8(), results[0].image);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn cancelled_before_start() {
    let pipeline = PanoramaPipeline::new(every_frame()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = pipeline
        .run(&mut VecFrameSource::new(scenes(&[3])), &NoProgress, &cancel)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

#[test]
fn cancelled_between_segments() {
    let pipeline = PanoramaPipeline::new(every_frame()).unwrap();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    // Abort as soon as segmentation reports in.
    let progress = move |percent: u8, _stage: &str| {
        if percent >= 40 {
            trigger.cancel();
        }
    };
    let err = pipeline
        .run(&mut VecFrameSource::new(scenes(&[2, 2])), &progress, &cancel)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

#[test]
fn progress_is_monotonic_and_complete() {
    let seen: Arc<Mutex<Vec<(u8, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress = move |percent: u8, stage: &str| {
        sink.lock().unwrap().push((percent, stage.to_owned()));
    };
    let pipeline = PanoramaPipeline::new(every_frame()).unwrap();
    pipeline
        .run(
            &mut VecFrameSource::new(scenes(&[2, 3, 2])),
            &progress,
            &CancelToken::new(),
        )
        .unwrap();

    let seen = seen.lock().unwrap();
    let percents: Vec<u8> = seen.iter().map(|(p, _)| *p).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert!(seen.iter().any(|(p, s)| *p == 30 && s == "frames selected"));
    assert!(seen.iter().any(|(p, s)| *p == 40 && s == "segmented"));
    assert!(seen.iter().any(|(_, s)| s == "segment 3/3 stitched"));
    assert_eq!(seen.last().map(|(p, s)| (*p, s.as_str())), Some((100, "complete")));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = PipelineConfig {
        strip_height: 0,
        ..PipelineConfig::default()
    };
    assert!(matches!(
        PanoramaPipeline::new(config),
        Err(PipelineError::InvalidConfig(_))
    ));
}
