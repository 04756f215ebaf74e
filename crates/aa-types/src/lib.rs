pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod interfaces;
pub mod metrics;
pub mod policy;

pub use checkpoint::*;
pub use config::*;
pub use errors::*;
pub use interfaces::*;
pub use metrics::*;
pub use policy::*;
