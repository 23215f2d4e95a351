pub mod config;
pub mod error;
pub mod probability;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use probability::normalize_classes;
pub use traits::*;
pub use types::*;
