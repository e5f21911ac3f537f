pub mod config;
pub mod fs;
pub mod math;

pub use config::*;
pub use fs::*;
pub use math::*;
