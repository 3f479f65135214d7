pub mod fmt;
pub mod types;

pub use types::*;
