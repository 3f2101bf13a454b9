pub mod blocked_contact;
pub mod channel;
pub mod event;
pub mod scheduled_message;

pub use blocked_contact::*;
pub use channel::*;
pub use event::*;
pub use scheduled_message::*;
