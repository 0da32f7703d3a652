//! Services layer for Asclepius
//!
//! External collaborators the learning loop calls into.

pub mod inference;

pub use inference::{InferenceService, RuleBasedInference, DIAGNOSIS_PROFILES};
