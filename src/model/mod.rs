//! Gating Model
//!
//! Strongly-typed metadata for the offline-trained classifier and the
//! scorer that applies it to detected setups.

pub mod artifact;
pub mod scorer;

pub use artifact::{FilterFlags, ModelArtifact};
pub use scorer::{GbdtModel, ProbabilityModel, ScoreMode, Signal, SignalScorer};
