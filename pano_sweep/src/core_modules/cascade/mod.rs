// THEORY:
// The alignment cascade turns one segment into exactly one panorama. It is an
// ordered list of strategies sharing a single contract, tried strictly in
// order until one produces an acceptable image:
//
//   A. global stitch      (external, opaque)
//   B. homography chain   (pairwise ORB + RANSAC, composite onto frame 0)
//   C. optical-flow mosaic (dense Farnebäck flow, running 50/50 blend)
//   D. pushbroom strips   (no alignment at all; cannot fail)
//
// Tiers report one of three outcomes. `Success` ends the cascade. `Failed`
// moves on. `Degenerate` means the tier technically produced an image but did
// no real work (nothing was warped or composited); whether that image is
// accepted or the next tier gets a chance is a run-wide `DegeneratePolicy`.
//
// Tier D is held apart from the configurable list so that no combination of
// strategies can leave a segment without a result. Only the driver looks at
// tier identity; strategies know nothing about their neighbours.
//
// Pixel buffers of tiers that were not accepted are dropped inside the loop.
// What survives about them is an `AttemptSummary`: tier, kind and reason.

pub mod flow_mosaic;
pub mod global;
pub mod homography_chain;
pub mod pushbroom;

use crate::core_modules::segmenter::Segment;
use crate::error::{PipelineError, Result};
use crate::pipeline::{CancelToken, DegeneratePolicy, PipelineConfig};
use flow_mosaic::FlowMosaicTier;
use global::{GlobalStitchTier, GlobalStitcher};
use homography_chain::HomographyChainTier;
use image::RgbImage;
use pushbroom::PushbroomTier;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifies a cascade tier, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierId {
    A,
    B,
    C,
    D,
}

impl TierId {
    pub fn label(&self) -> &'static str {
        match self {
            TierId::A => "A",
            TierId::B => "B",
            TierId::C => "C",
            TierId::D => "D",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TierId::A => "global stitch",
            TierId::B => "pairwise homography chain",
            TierId::C => "optical-flow mosaic",
            TierId::D => "pushbroom strips",
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub enum TierOutcome {
    Success(RgbImage),
    /// An image was produced, but the tier did no effective alignment.
    Degenerate { image: RgbImage, reason: String },
    Failed { reason: String },
}

/// What one tier produced for one segment.
#[derive(Debug, Clone)]
pub struct StitchAttemptResult {
    pub tier: TierId,
    pub outcome: TierOutcome,
}

impl StitchAttemptResult {
    pub fn succeeded(tier: TierId, image: RgbImage) -> Self {
        Self {
            tier,
            outcome: TierOutcome::Success(image),
        }
    }

    pub fn degenerate(tier: TierId, image: RgbImage, reason: impl Into<String>) -> Self {
        Self {
            tier,
            outcome: TierOutcome::Degenerate {
                image,
                reason: reason.into(),
            },
        }
    }

    pub fn failed(tier: TierId, reason: impl Into<String>) -> Self {
        Self {
            tier,
            outcome: TierOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    /// True whenever an image was produced, degenerate or not.
    pub fn success(&self) -> bool {
        !matches!(self.outcome, TierOutcome::Failed { .. })
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self.outcome, TierOutcome::Degenerate { .. })
    }

    pub fn image(&self) -> Option<&RgbImage> {
        match &self.outcome {
            TierOutcome::Success(image) | TierOutcome::Degenerate { image, .. } => Some(image),
            TierOutcome::Failed { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            TierOutcome::Success(_) => None,
            TierOutcome::Degenerate { reason, .. } | TierOutcome::Failed { reason } => Some(reason),
        }
    }

    pub fn summary(&self) -> AttemptSummary {
        let kind = match self.outcome {
            TierOutcome::Success(_) => AttemptKind::Success,
            TierOutcome::Degenerate { .. } => AttemptKind::Degenerate,
            TierOutcome::Failed { .. } => AttemptKind::Failed,
        };
        AttemptSummary {
            tier: self.tier,
            kind,
            reason: self.reason().map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Success,
    Degenerate,
    Failed,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::Success => "success",
            AttemptKind::Degenerate => "degenerate",
            AttemptKind::Failed => "failed",
        }
    }
}

/// Pixel-free record of one tier attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSummary {
    pub tier: TierId,
    pub kind: AttemptKind,
    pub reason: Option<String>,
}

/// One way of turning a segment into a panorama.
pub trait StitchStrategy: Send + Sync {
    fn tier(&self) -> TierId;

    /// Only cancellation is an error; a tier that cannot stitch the segment
    /// says so through `TierOutcome::Failed`.
    fn attempt(&self, segment: &Segment, cancel: &CancelToken) -> Result<StitchAttemptResult>;
}

/// The accepted output of a cascade run.
#[derive(Debug, Clone)]
pub struct CascadeOutput {
    pub tier: TierId,
    pub image: RgbImage,
    pub degenerate: bool,
    pub attempts: Vec<AttemptSummary>,
}

pub struct AlignmentCascade {
    tiers: Vec<Box<dyn StitchStrategy>>,
    last_resort: PushbroomTier,
    policy: DegeneratePolicy,
}

impl AlignmentCascade {
    /// `tiers` are tried in order; pushbroom strips of `strip_height` rows
    /// always close the chain.
    pub fn new(tiers: Vec<Box<dyn StitchStrategy>>, strip_height: u32, policy: DegeneratePolicy) -> Self {
        Self {
            tiers,
            last_resort: PushbroomTier::new(strip_height),
            policy,
        }
    }

    /// The standard A → B → C → D chain.
    pub fn from_config(config: &PipelineConfig, global: Arc<dyn GlobalStitcher>) -> Result<Self> {
        let tiers: Vec<Box<dyn StitchStrategy>> = vec![
            Box::new(GlobalStitchTier::new(global)),
            Box::new(HomographyChainTier::new(config.pair_align_params())),
            Box::new(FlowMosaicTier::new(
                config.flow.clone(),
                config.flow_mag_threshold,
            )?),
        ];
        Ok(Self::new(tiers, config.strip_height, config.degenerate_policy))
    }

    pub fn tiers(&self) -> Vec<TierId> {
        self.tiers
            .iter()
            .map(|t| t.tier())
            .chain(std::iter::once(self.last_resort.tier()))
            .collect()
    }

    pub fn run(&self, segment: &Segment, cancel: &CancelToken) -> Result<CascadeOutput> {
        let mut attempts = Vec::with_capacity(self.tiers.len() + 1);

        for strategy in &self.tiers {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let tier = strategy.tier();
            debug!(segment = segment.index, %tier, "attempting {}", tier.description());
            let result = strategy.attempt(segment, cancel)?;
            attempts.push(result.summary());

            match result.outcome {
                TierOutcome::Success(image) => {
                    info!(segment = segment.index, tier = %result.tier, "segment stitched");
                    return Ok(CascadeOutput {
                        tier: result.tier,
                        image,
                        degenerate: false,
                        attempts,
                    });
                }
                TierOutcome::Degenerate { image, reason } => match self.policy {
                    DegeneratePolicy::Accept => {
                        warn!(segment = segment.index, tier = %result.tier, %reason, "accepting degenerate result");
                        return Ok(CascadeOutput {
                            tier: result.tier,
                            image,
                            degenerate: true,
                            attempts,
                        });
                    }
                    DegeneratePolicy::FallThrough => {
                        warn!(segment = segment.index, tier = %result.tier, %reason, "degenerate result, falling through");
                    }
                },
                TierOutcome::Failed { reason } => {
                    debug!(segment = segment.index, tier = %result.tier, %reason, "tier failed");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let image = self.last_resort.stitch(segment)?;
        attempts.push(AttemptSummary {
            tier: self.last_resort.tier(),
            kind: AttemptKind::Success,
            reason: None,
        });
        info!(segment = segment.index, tier = %self.last_resort.tier(), "segment stitched");
        Ok(CascadeOutput {
            tier: self.last_resort.tier(),
            image,
            degenerate: false,
            attempts,
        })
    }
}
