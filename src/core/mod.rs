pub mod cooldown;
pub mod engine;
pub mod reconciler;
pub mod series;
pub mod sizing;
