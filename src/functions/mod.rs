pub mod queue;
pub mod scheduled_delivery;
pub mod trigger;

pub use queue::*;
pub use scheduled_delivery::*;
pub use trigger::*;
