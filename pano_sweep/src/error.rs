// THEORY:
// Only whole-video conditions are errors. A single tier failing for a single
// segment is an ordinary, expected event inside the alignment cascade and is
// carried as a `TierOutcome`, never as a `PipelineError`. Everything in this
// enum ends the run for the current video.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Fewer usable frames survived selection than one segment needs.
    #[error("insufficient frames: {selected} usable, at least {required} required")]
    InsufficientFrames { selected: usize, required: usize },

    /// Selection succeeded, but every accumulated run was too short to keep.
    #[error("no segments found among {frames} selected frames")]
    NoSegmentsFound { frames: usize },

    #[error("processing cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("frame {index} is {found:?}, expected {expected:?}")]
    FrameDimensionMismatch {
        index: u64,
        expected: (u32, u32),
        found: (u32, u32),
    },

    /// The pushbroom canvas for this many strips does not fit in memory.
    #[error("pushbroom output for {frames} strips of {strip_height} rows is too large")]
    OutputTooLarge { frames: usize, strip_height: u32 },

    #[error("frame source error: {0}")]
    Source(String),

    #[error(transparent)]
    Encode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
