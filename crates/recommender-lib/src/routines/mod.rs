//! Recommender routines
//!
//! - `feeder`: drains the input queue into the cluster state
//! - `recommender`: a single iteration
//! - `loop`: the timed loop around it

mod feeder;
mod r#loop;
mod recommender;

#[cfg(test)]
mod tests;

pub use feeder::{input_channel, ClusterStateFeeder, FeedSummary, InputEvent, InputReceiver, InputSender};
pub use r#loop::{RecommenderLoop, RecommenderLoopBuilder};
pub use recommender::{IterationSummary, Recommender, StatusWriter};
