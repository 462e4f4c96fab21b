//! Pure normalization stages between provider output and the canonical
//! finding schema. No I/O happens in this module.

pub mod normalizer;
pub mod severity;

pub use normalizer::{clamp_confidence, normalize_finding, RawDetection};
pub use severity::{map_severity, map_severity_score};
