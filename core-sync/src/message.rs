//! Message-created updates, including the placeholder shown in place of a
//! message that could not be built.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{MessageCreated, MessageMetadata};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::labels::LabelMap;
use crate::mailbox::{local_message, want_labels};

const LINE_WIDTH: usize = 76;

/// Outcome of building one message.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub address_id: String,
    pub message_id: String,
    pub update: MessageCreated,
}

/// Announce `literal` in every wanted mailbox of the message.
pub fn message_created(labels: &LabelMap, metadata: &MessageMetadata, literal: Bytes) -> MessageCreated {
    MessageCreated {
        message: local_message(metadata),
        literal,
        mailbox_ids: want_labels(labels, &metadata.label_ids),
    }
}

/// Announce the placeholder literal for a message that failed to build.
pub fn failed_message_created(
    labels: &LabelMap,
    metadata: &MessageMetadata,
    error: &str,
) -> MessageCreated {
    let date = Utc
        .timestamp_opt(metadata.time, 0)
        .single()
        .unwrap_or_default();
    let literal = failed_message_literal(&metadata.id, date, &metadata.subject, error);

    message_created(labels, metadata, Bytes::from(literal))
}

/// Plain-text literal describing a build failure.
pub fn failed_message_literal(
    message_id: &str,
    date: DateTime<Utc>,
    subject: &str,
    error: &str,
) -> Vec<u8> {
    let mut literal = format!(
        "Date: {}\r\n\
         Subject: Message failed to build\r\n\
         Content-Type: text/plain\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n",
        date.format("%d %b %y %H:%M UTC")
    )
    .into_bytes();

    let body = format!(
        "Failed to build message: \nSubject:   {subject}\nError:     {error}\nMessageID: {message_id}\n"
    );
    let encoded = STANDARD.encode(body);
    let wrapped: Vec<&[u8]> = encoded.as_bytes().chunks(LINE_WIDTH).collect();
    literal.extend_from_slice(&wrapped.join(&b"\r\n"[..]));

    literal
}
