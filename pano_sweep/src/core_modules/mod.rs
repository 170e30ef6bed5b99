pub mod cascade;
pub mod continuity;
pub mod export;
pub mod features;
pub mod frame;
pub mod frame_selector;
pub mod image_ops;
pub mod optical_flow;
pub mod segmenter;
