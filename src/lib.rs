pub mod capture;
pub mod cli;
pub mod error;

pub use error::{PodlensError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
