pub mod battery;
pub mod device;
pub mod plan;
pub mod series;

pub use battery::*;
pub use device::*;
pub use plan::*;
pub use series::*;
