pub mod clock;
pub mod error;
pub mod merge;
pub mod model;
pub mod validate;

// Re-export commonly used types and functions
pub use error::SyncError;
pub use merge::merge;
pub use model::{ProgressEntry, ProgressMap};
