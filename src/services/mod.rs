pub mod chat_id;
pub mod delivery_settings;
pub mod waha_client;

pub use chat_id::*;
pub use delivery_settings::*;
pub use waha_client::*;
