//! Message building on top of [`MessageCrypto`] and the account identity.

use std::collections::HashMap;
use std::sync::Arc;

use bridge_traits::{BridgeError, FullMessage, KeyRing, MessageCrypto};
use bytes::Bytes;
use core_sync::labels::LabelMap;
use core_sync::message::message_created;
use core_sync::{BuildResult, MessageBuilder, SharedIdentity};

use crate::error::{Result, ServiceError};

/// Decrypts messages with the keyring of their address.
pub struct CryptoMessageBuilder {
    identity: SharedIdentity,
    crypto: Arc<dyn MessageCrypto>,
}

impl CryptoMessageBuilder {
    pub fn new(identity: SharedIdentity, crypto: Arc<dyn MessageCrypto>) -> Self {
        Self { identity, crypto }
    }

    pub fn key_ring(&self, address_id: &str) -> Result<KeyRing> {
        self.identity
            .read()
            .key_ring(address_id)
            .cloned()
            .ok_or_else(|| ServiceError::MissingKeyRing(address_id.to_string()))
    }

    /// RFC 822 literal of `message`.
    pub fn build_literal(&self, message: &FullMessage) -> Result<Bytes> {
        let key = self.key_ring(&message.metadata().address_id)?;
        self.crypto
            .build_rfc822(&key, message)
            .map(Bytes::from)
            .map_err(|err| ServiceError::Build {
                message_id: message.id().to_string(),
                reason: err.to_string(),
            })
    }

    /// Literal plus the mailboxes it belongs in.
    pub fn build_update(&self, labels: &LabelMap, message: &FullMessage) -> Result<BuildResult> {
        let key = self.key_ring(&message.metadata().address_id)?;
        self.build_message(labels, message, &key)
            .map_err(|err| ServiceError::Build {
                message_id: message.id().to_string(),
                reason: err.to_string(),
            })
    }
}

impl MessageBuilder for CryptoMessageBuilder {
    fn key_rings(&self) -> HashMap<String, KeyRing> {
        let identity = self.identity.read();
        identity
            .addresses()
            .iter()
            .filter_map(|addr| {
                identity
                    .key_ring(&addr.id)
                    .map(|key| (addr.id.clone(), key.clone()))
            })
            .collect()
    }

    fn build_message(
        &self,
        labels: &LabelMap,
        message: &FullMessage,
        key: &KeyRing,
    ) -> std::result::Result<BuildResult, BridgeError> {
        let literal = self.crypto.build_rfc822(key, message)?;
        let metadata = message.metadata();

        Ok(BuildResult {
            address_id: metadata.address_id.clone(),
            message_id: metadata.id.clone(),
            update: message_created(labels, metadata, Bytes::from(literal)),
        })
    }
}

impl std::fmt::Debug for CryptoMessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoMessageBuilder")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
