//! # Greeter Channels
//!
//! Concrete implementations of the core seams:
//! - [`http::HttpEmailSender`]: vendor email API over HTTP
//! - [`smtp::SmtpSender`]: SMTP relay via lettre
//! - [`users::SqliteUserStore`]: the user table

pub mod http;
pub mod message;
pub mod smtp;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use greeter_core::config::GreeterConfig;
use greeter_core::error::{GreeterError, Result};
use greeter_core::traits::Sender;

pub use http::HttpEmailSender;
pub use message::{RenderedMessage, render};
pub use smtp::SmtpSender;
pub use users::SqliteUserStore;

/// Create the sender named by `sender.kind`.
pub fn create_sender(config: &GreeterConfig) -> Result<Arc<dyn Sender>> {
    let timeout = Duration::from_secs(config.worker.send_timeout_secs);
    match config.sender.kind.as_str() {
        "http" => Ok(Arc::new(HttpEmailSender::new(&config.sender.http, timeout)?)),
        "smtp" => {
            let smtp = config.sender.smtp.as_ref().ok_or_else(|| {
                GreeterError::Config("sender.kind = \"smtp\" requires a [sender.smtp] section".into())
            })?;
            Ok(Arc::new(SmtpSender::new(smtp, timeout)?))
        }
        other => Err(GreeterError::Config(format!("Unknown sender: {other}"))),
    }
}
