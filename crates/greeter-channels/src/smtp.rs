//! SMTP delivery via async lettre (STARTTLS relay).

use async_trait::async_trait;
use chrono::NaiveDate;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

use greeter_core::config::SmtpSenderConfig;
use greeter_core::error::{GreeterError, Result, SendError};
use greeter_core::traits::Sender;
use greeter_core::{Contact, MessageType};

use crate::message::render;

pub struct SmtpSender {
    from: Mailbox,
    timeout: Duration,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &SmtpSenderConfig, timeout: Duration) -> Result<Self> {
        let from_name = config.display_name.as_deref().unwrap_or("Greeter");
        let from: Mailbox = format!("{from_name} <{}>", config.from)
            .parse()
            .map_err(|e| GreeterError::Config(format!("Invalid from address: {e}")))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| GreeterError::Sender(format!("SMTP relay: {e}")))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            from,
            timeout,
            mailer,
        })
    }
}

/// Map a lettre SMTP error onto the retry taxonomy. 4yz replies and
/// connection trouble are worth retrying, 5yz replies are not.
fn classify(e: lettre::transport::smtp::Error, timeout: Duration) -> SendError {
    if e.is_timeout() {
        SendError::Timeout(timeout.as_secs())
    } else if e.is_permanent() {
        SendError::Permanent(format!("SMTP rejected: {e}"))
    } else {
        SendError::Transient(format!("SMTP: {e}"))
    }
}

#[async_trait]
impl Sender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        contact: &Contact,
        message_type: MessageType,
        occurrence_date: NaiveDate,
    ) -> std::result::Result<(), SendError> {
        let to: Mailbox = format!("{} <{}>", contact.name, contact.email)
            .parse()
            .map_err(|e| SendError::Permanent(format!("Invalid recipient: {e}")))?;
        let message = render(message_type, contact);

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(message.body)
            .map_err(|e| SendError::Permanent(format!("Build email: {e}")))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| classify(e, self.timeout))?;

        tracing::debug!(
            user_id = %contact.user_id,
            occurrence = %occurrence_date,
            "📤 SMTP accepted {message_type}"
        );
        Ok(())
    }
}
