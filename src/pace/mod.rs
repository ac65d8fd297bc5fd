pub mod config;
pub mod fusion;

pub use config::PaceFusionConfig;
pub use fusion::{fuse, PaceFusionInput, PaceFusionState};
