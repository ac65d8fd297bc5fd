pub mod controller;
pub mod state;

pub use controller::{Collaborators, SessionConfig, SessionController};
pub use state::{LiveStats, RunState};
