//! Data-side building blocks: class grouping, checkpoint storage and an
//! in-process synthetic backend.

pub mod groups;
pub mod storage;
pub mod synthetic;

pub use groups::*;
pub use storage::*;
pub use synthetic::*;
