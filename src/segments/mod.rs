pub mod recorder;

pub use recorder::{SegmentRecorder, SegmentSnapshot};
