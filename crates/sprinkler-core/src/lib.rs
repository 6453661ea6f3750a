pub mod actuator;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_log;
pub mod hardware;
pub mod mirror;
pub mod scenario;
pub mod store;
pub mod system;

pub use error::{CommandStatus, Result, SprinklerError};
pub use system::SprinklerSystem;
