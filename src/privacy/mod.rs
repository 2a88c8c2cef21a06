pub mod anonymity;
pub mod deid;
pub mod mechanisms;
pub mod sensitivity;

pub use anonymity::{KAnonymizer, LDiversifier};
pub use deid::{DeIdRewriter, SUPPRESSED};
pub use mechanisms::{ExponentialMechanism, SparseVectorTechnique};
pub use sensitivity::SensitivityAnalyzer;
