pub mod engine;
pub mod population;
pub mod types;

pub use engine::*;
pub use types::*;
