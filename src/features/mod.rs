pub mod pipeline;

pub use pipeline::{DefaultFeatureComputer, FeatureComputer};
