//! Hierarchical segment addressing for long videos: a grounding answer names a
//! (layer, segment, sampling rate) triple over an implicit binary segment tree,
//! ground truth is aligned onto that tree when building training data, and
//! rollouts are scored against it with a shaped reward.

pub mod alignment;
pub mod annotation;
pub mod dataset;
pub mod grounding;
pub mod model;
pub mod prompt;
pub mod reward;
pub mod sampling;
pub mod segment;
pub mod store;
pub mod util;
pub mod video;
