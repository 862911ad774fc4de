pub mod barrier;
pub mod fence;
pub mod recorder;
pub mod state;
