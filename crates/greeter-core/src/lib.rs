//! # Greeter Core
//!
//! Shared building blocks for the Greeter workspace:
//! - [`config`]: TOML configuration with serde defaults
//! - [`error`]: the workspace error type and the Sender failure taxonomy
//! - [`types`]: users, contacts, message types and month-day matching
//! - [`traits`]: seams to external collaborators (user store, sender, clock)

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{GreeterError, Result, SendError};
pub use types::{Contact, MessageType, MonthDay, User};
