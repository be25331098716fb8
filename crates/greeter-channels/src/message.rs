//! Message text per message type.

use greeter_core::{Contact, MessageType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

pub fn render(message_type: MessageType, contact: &Contact) -> RenderedMessage {
    match message_type {
        MessageType::Birthday => RenderedMessage {
            subject: "Happy birthday!".into(),
            body: format!("Hey, {} it's your birthday", contact.name),
        },
        MessageType::Anniversary => RenderedMessage {
            subject: "Happy anniversary!".into(),
            body: format!("Hey, {} happy anniversary", contact.name),
        },
    }
}
