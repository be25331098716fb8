//! Sender trait: the outbound message provider.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::SendError;
use crate::types::{Contact, MessageType};

/// Delivers one message to one contact.
///
/// Implementations classify every failure as transient or permanent; the
/// worker decides what to do with it.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Short name used in logs ("http", "smtp").
    fn name(&self) -> &str;

    async fn send(
        &self,
        contact: &Contact,
        message_type: MessageType,
        occurrence_date: NaiveDate,
    ) -> Result<(), SendError>;
}
