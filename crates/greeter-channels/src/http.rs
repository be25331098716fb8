//! Vendor email API over HTTP.
//!
//! POSTs `{"email", "message", "subject", "from"}` as JSON. Response
//! classification follows the vendor's retry guidance:
//! - 2xx → delivered
//! - 408, 429, 5xx, timeouts and connection errors → transient
//! - any other status → permanent

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

use greeter_core::config::HttpSenderConfig;
use greeter_core::error::{GreeterError, Result, SendError};
use greeter_core::traits::Sender;
use greeter_core::{Contact, MessageType};

use crate::message::render;

/// Longest response body echoed into `last_error`.
const MAX_ERROR_BODY: usize = 200;

pub struct HttpEmailSender {
    endpoint: String,
    api_key: String,
    from: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpEmailSender {
    pub fn new(config: &HttpSenderConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GreeterError::Sender(format!("HTTP client: {e}")))?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
            timeout,
            client,
        })
    }

    fn classify_transport(&self, e: reqwest::Error) -> SendError {
        if e.is_timeout() {
            SendError::Timeout(self.timeout.as_secs())
        } else if e.is_builder() {
            SendError::Permanent(format!("request rejected before sending: {e}"))
        } else {
            SendError::Transient(format!("transport error: {e}"))
        }
    }
}

/// Map a non-success HTTP status to the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> SendError {
    let mut detail = format!("HTTP {}", status.as_u16());
    let body = body.trim();
    if !body.is_empty() {
        detail.push_str(": ");
        detail.extend(body.chars().take(MAX_ERROR_BODY));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        SendError::Transient(detail)
    } else {
        SendError::Permanent(detail)
    }
}

#[async_trait]
impl Sender for HttpEmailSender {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        contact: &Contact,
        message_type: MessageType,
        occurrence_date: NaiveDate,
    ) -> std::result::Result<(), SendError> {
        let message = render(message_type, contact);
        let body = json!({
            "email": contact.email,
            "message": message.body,
            "subject": message.subject,
            "from": self.from,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let resp = req.send().await.map_err(|e| self.classify_transport(e))?;
        let status = resp.status();
        if status.is_success() {
            tracing::debug!(
                user_id = %contact.user_id,
                occurrence = %occurrence_date,
                "📧 Vendor accepted {message_type}"
            );
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }
}
