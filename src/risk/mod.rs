// Risk management module
pub mod profile;

pub use profile::{RiskError, RiskProfile, RiskProfiles, DEFAULT_PROFILE};
