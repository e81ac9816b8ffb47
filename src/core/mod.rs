pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod message;
pub mod reconnect;
pub mod types;

pub use frame::*;
pub use health::*;
pub use heartbeat::*;
pub use message::*;
pub use reconnect::*;
pub use types::*;
