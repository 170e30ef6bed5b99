use pano_sweep::PanoramaResult;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub input: PathBuf,
    /// `"ok"` or the terminal condition that ended the run without results.
    pub status: String,
    pub segments: Vec<SegmentEntry>,
}

#[derive(Debug, Serialize)]
pub struct SegmentEntry {
    pub segment_index: usize,
    pub tier: String,
    pub tier_description: String,
    pub degenerate: bool,
    pub frame_indices: Vec<u64>,
    pub file: PathBuf,
    pub attempts: Vec<AttemptEntry>,
}

#[derive(Debug, Serialize)]
pub struct AttemptEntry {
    pub tier: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SegmentEntry {
    pub fn new(result: &PanoramaResult, file: PathBuf) -> Self {
        Self {
            segment_index: result.segment_index,
            tier: result.tier.label().to_owned(),
            tier_description: result.tier.description().to_owned(),
            degenerate: result.degenerate,
            frame_indices: result.frame_indices.clone(),
            file,
            attempts: result
                .attempts
                .iter()
                .map(|a| AttemptEntry {
                    tier: a.tier.label().to_owned(),
                    outcome: a.kind.as_str().to_owned(),
                    reason: a.reason.clone(),
                })
                .collect(),
        }
    }
}

impl Manifest {
    pub fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join("manifest.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
