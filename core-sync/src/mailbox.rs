//! # Mailbox Naming & Update Builders
//!
//! Maps remote labels onto local mailbox names and builds the [`Update`]s
//! announcing them.
//!
//! ## Naming
//!
//! | Label kind | Mailbox name |
//! |------------|--------------|
//! | Folder | `["Folders", ..path]` |
//! | Label | `["Labels", ..path]` |
//! | System, contact group | `path` |
//!
//! The two prefixes are themselves placeholder mailboxes (`\Noselect`) whose
//! id equals their name.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::store::{
    ATTR_ALL, ATTR_ARCHIVE, ATTR_DRAFTS, ATTR_FLAGGED, ATTR_JUNK, ATTR_NO_INFERIORS,
    ATTR_NO_SELECT, ATTR_SENT, ATTR_TRASH, FLAG_ANSWERED, FLAG_DELETED, FLAG_DRAFT, FLAG_FLAGGED,
    FLAG_SEEN, FORWARDED_FLAGS,
};
use bridge_traits::{label_ids, FlagSet, LabelKind, Mailbox, Message, MessageMetadata, RemoteLabel, Update};
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::labels::LabelMap;

pub const FOLDER_PREFIX: &str = "Folders";
pub const LABEL_PREFIX: &str = "Labels";
pub const TEMP_PREFIX: &str = "tmp_";
pub const INBOX_NAME: &str = "INBOX";
pub const SCHEDULED_NAME: &str = "Scheduled";

/// Local mailbox name of a label.
pub fn mailbox_name(label: &RemoteLabel) -> Vec<String> {
    match label.kind {
        LabelKind::Folder => prefixed(FOLDER_PREFIX, &label.path),
        LabelKind::Label => prefixed(LABEL_PREFIX, &label.path),
        LabelKind::System | LabelKind::ContactGroup => label.path.clone(),
    }
}

fn prefixed(prefix: &str, path: &[String]) -> Vec<String> {
    std::iter::once(prefix.to_string())
        .chain(path.iter().cloned())
        .collect()
}

/// Mailbox name with the temporary prefix on its last segment.
pub fn mailbox_name_with_temp_prefix(label: &RemoteLabel) -> Vec<String> {
    let mut name = mailbox_name(label);
    if let Some(last) = name.last_mut() {
        *last = format!("{TEMP_PREFIX}{last}");
    }
    name
}

/// Whether a label is exposed as a mailbox.
pub fn want_label(label: &RemoteLabel) -> bool {
    match label.kind {
        LabelKind::System => matches!(
            label.id.as_str(),
            label_ids::INBOX
                | label_ids::TRASH
                | label_ids::SPAM
                | label_ids::ALL_MAIL
                | label_ids::ARCHIVE
                | label_ids::SENT
                | label_ids::DRAFTS
                | label_ids::STARRED
                | label_ids::ALL_SCHEDULED
        ),
        LabelKind::ContactGroup => false,
        LabelKind::Folder | LabelKind::Label => true,
    }
}

/// The subset of `label_ids` that are known and exposed.
pub fn want_labels(labels: &LabelMap, label_ids: &[String]) -> Vec<String> {
    label_ids
        .iter()
        .filter(|id| labels.get(id.as_str()).is_some_and(want_label))
        .cloned()
        .collect()
}

pub fn is_all_mail_or_scheduled(mailbox_id: &str) -> bool {
    mailbox_id == label_ids::ALL_MAIL || mailbox_id == label_ids::ALL_SCHEDULED
}

/// Log-safe identifier of a label path: base64(SHA-256(joined path)).
pub fn hash_label_path(path: &[String]) -> String {
    STANDARD.encode(Sha256::digest(path.concat().as_bytes()))
}

pub fn default_mailbox_flags() -> FlagSet {
    let mut flags: FlagSet = [FLAG_SEEN, FLAG_FLAGGED, FLAG_DELETED].into_iter().collect();
    for flag in FORWARDED_FLAGS {
        flags.insert(flag);
    }
    flags
}

pub fn default_mailbox_permanent_flags() -> FlagSet {
    default_mailbox_flags()
}

fn plain_mailbox(id: &str, name: Vec<String>) -> Mailbox {
    Mailbox {
        id: id.to_string(),
        name,
        flags: default_mailbox_flags(),
        permanent_flags: default_mailbox_permanent_flags(),
        attributes: FlagSet::new(),
    }
}

pub fn mailbox_created(id: &str, name: Vec<String>) -> Update {
    Update::MailboxCreated(plain_mailbox(id, name))
}

pub fn mailbox_updated_or_created(id: &str, name: Vec<String>) -> Update {
    Update::MailboxUpdatedOrCreated(plain_mailbox(id, name))
}

/// Placeholder container mailbox, id equal to its name.
pub fn placeholder_mailbox_created(prefix: &str) -> Update {
    Update::MailboxCreated(Mailbox {
        attributes: FlagSet::new().with(ATTR_NO_SELECT),
        ..plain_mailbox(prefix, vec![prefix.to_string()])
    })
}

pub fn system_mailbox_created(id: &str, name: &str) -> Update {
    let mut name = if name.eq_ignore_ascii_case(INBOX_NAME) {
        INBOX_NAME.to_string()
    } else {
        name.to_string()
    };

    let mut mailbox = plain_mailbox(id, Vec::new());
    mailbox.attributes.insert(ATTR_NO_INFERIORS);

    match id {
        label_ids::TRASH => mailbox.attributes.insert(ATTR_TRASH),
        label_ids::SPAM => mailbox.attributes.insert(ATTR_JUNK),
        label_ids::ALL_MAIL => {
            mailbox.attributes.insert(ATTR_ALL);
            mailbox.flags = [FLAG_SEEN, FLAG_FLAGGED].into_iter().collect();
            mailbox.permanent_flags = mailbox.flags.clone();
        }
        label_ids::ARCHIVE => mailbox.attributes.insert(ATTR_ARCHIVE),
        label_ids::SENT => mailbox.attributes.insert(ATTR_SENT),
        label_ids::DRAFTS => mailbox.attributes.insert(ATTR_DRAFTS),
        label_ids::STARRED => mailbox.attributes.insert(ATTR_FLAGGED),
        // The service calls it "All Scheduled"
        label_ids::ALL_SCHEDULED => name = SCHEDULED_NAME.to_string(),
        _ => {}
    }

    mailbox.name = vec![name];
    Update::MailboxCreated(mailbox)
}

/// Flags a client should see for a message.
pub fn message_flags(metadata: &MessageMetadata) -> FlagSet {
    let mut flags = FlagSet::new();

    if metadata.seen() {
        flags.insert(FLAG_SEEN);
    }
    if metadata.starred() {
        flags.insert(FLAG_FLAGGED);
    }
    if metadata.is_draft() {
        flags.insert(FLAG_DRAFT);
    }
    if metadata.is_replied || metadata.is_replied_all {
        flags.insert(FLAG_ANSWERED);
    }
    if metadata.is_forwarded {
        for flag in FORWARDED_FLAGS {
            flags.insert(flag);
        }
    }

    flags
}

/// Local message record; a zero timestamp dates the message now.
pub fn local_message(metadata: &MessageMetadata) -> Message {
    let date: DateTime<Utc> = if metadata.time > 0 {
        Utc.timestamp_opt(metadata.time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };

    Message {
        id: metadata.id.clone(),
        flags: message_flags(metadata),
        date,
    }
}
