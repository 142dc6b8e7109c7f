//! DRM driver implementations.

pub mod local;
pub mod mock;

pub use local::LocalDrm;
pub use mock::{MockDrm, MockOutcome};
