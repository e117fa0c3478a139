//! # Identity State
//!
//! The user, its addresses (kept sorted by display order) and the unlocked
//! keyring of each address. Shared between the account actor, the connectors
//! and the sync message builder through [`SharedIdentity`].
//!
//! Refreshing the identity requires remote calls; those run without any lock
//! held and the result is applied afterwards under the write guard.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::{Address, KeyRing, MessageCrypto, RemoteApi, User};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;

/// Outcome of applying an address event to the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressUpdate {
    Noop,
    Created,
    Enabled,
    Disabled,
    Updated,
    Deleted,
}

/// Drop the `+alias` part of the local part of an address.
pub fn strip_plus_alias(address: &str) -> String {
    match (address.find('+'), address.find('@')) {
        (Some(plus), Some(at)) if plus > 0 && plus < at => {
            format!("{}{}", &address[..plus], &address[at..])
        }
        _ => address.to_string(),
    }
}

/// Case-insensitive address comparison ignoring `+alias`.
pub fn equal_addresses(a: &str, b: &str) -> bool {
    strip_plus_alias(a).eq_ignore_ascii_case(&strip_plus_alias(b))
}

#[derive(Clone)]
pub struct IdentityState {
    user: User,
    addresses: Vec<Address>,
    keys: HashMap<String, KeyRing>,
    password_digest: [u8; 32],
}

impl IdentityState {
    /// `bridge_password` is the raw password mail clients authenticate with.
    pub fn new(
        user: User,
        addresses: Vec<Address>,
        keys: HashMap<String, KeyRing>,
        bridge_password: &[u8],
    ) -> Self {
        let mut state = Self {
            user,
            addresses,
            keys,
            password_digest: Sha256::digest(bridge_password).into(),
        };
        state.sort_addresses();
        state
    }

    /// Fetch the user and addresses and unlock every enabled address.
    pub async fn fetch(
        api: &dyn RemoteApi,
        crypto: &dyn MessageCrypto,
        bridge_password: &[u8],
    ) -> Result<Self> {
        let (user, addresses, keys) = fetch_identity(api, crypto).await?;
        Ok(Self::new(user, addresses, keys, bridge_password))
    }

    fn sort_addresses(&mut self) {
        self.addresses.sort_by_key(|addr| addr.order);
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// Addresses sorted by display order.
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn primary_address(&self) -> Option<&Address> {
        self.addresses.first()
    }

    pub fn address(&self, id: &str) -> Option<&Address> {
        self.addresses.iter().find(|addr| addr.id == id)
    }

    pub fn address_by_email(&self, email: &str) -> Option<&Address> {
        self.addresses
            .iter()
            .find(|addr| equal_addresses(&addr.email, email))
    }

    pub fn key_ring(&self, address_id: &str) -> Option<&KeyRing> {
        self.keys.get(address_id)
    }

    /// Validate client credentials and return the matching address id.
    ///
    /// The password arrives base64 encoded, as shown to the user.
    pub fn check_auth(&self, email: &str, password: &[u8]) -> Option<String> {
        let decoded = STANDARD.decode(password).ok()?;
        let digest: [u8; 32] = Sha256::digest(&decoded).into();

        let diff = digest
            .iter()
            .zip(self.password_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return None;
        }

        self.address_by_email(email).map(|addr| addr.id.clone())
    }

    pub fn on_user_event(&mut self, user: User) {
        self.user = user;
    }

    /// Replace everything with freshly fetched values.
    pub fn apply_refresh(
        &mut self,
        user: User,
        addresses: Vec<Address>,
        keys: HashMap<String, KeyRing>,
    ) {
        self.user = user;
        self.addresses = addresses;
        self.keys = keys;
        self.sort_addresses();
    }

    pub fn on_address_created(&mut self, address: Address, key: Option<KeyRing>) -> AddressUpdate {
        if self.address(&address.id).is_some() {
            return AddressUpdate::Noop;
        }

        if let Some(key) = key {
            self.keys.insert(address.id.clone(), key);
        }
        let enabled = address.is_enabled();
        self.addresses.push(address);
        self.sort_addresses();

        if enabled {
            AddressUpdate::Created
        } else {
            AddressUpdate::Noop
        }
    }

    pub fn on_address_updated(&mut self, address: Address, key: Option<KeyRing>) -> AddressUpdate {
        let Some(old) = self.addresses.iter_mut().find(|a| a.id == address.id) else {
            return self.on_address_created(address, key);
        };

        let was_enabled = old.is_enabled();
        let is_enabled = address.is_enabled();
        *old = address;
        if let Some(key) = key {
            self.keys.insert(key.address_id.clone(), key);
        }
        self.sort_addresses();

        match (was_enabled, is_enabled) {
            (false, true) => AddressUpdate::Enabled,
            (true, false) => AddressUpdate::Disabled,
            _ => AddressUpdate::Updated,
        }
    }

    pub fn on_address_deleted(&mut self, id: &str) -> (Option<Address>, AddressUpdate) {
        let Some(pos) = self.addresses.iter().position(|a| a.id == id) else {
            return (None, AddressUpdate::Noop);
        };

        let address = self.addresses.remove(pos);
        self.keys.remove(id);

        if address.is_enabled() {
            (Some(address), AddressUpdate::Deleted)
        } else {
            (None, AddressUpdate::Noop)
        }
    }
}

impl std::fmt::Debug for IdentityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityState")
            .field("user_id", &self.user.id)
            .field("addresses", &self.addresses.len())
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// Fetch user, addresses and keys from the remote service.
///
/// Addresses whose keys fail to unlock are kept without a keyring; messages
/// for them are built as failure placeholders.
pub async fn fetch_identity(
    api: &dyn RemoteApi,
    crypto: &dyn MessageCrypto,
) -> Result<(User, Vec<Address>, HashMap<String, KeyRing>)> {
    let user = api.get_user().await?;
    let addresses = api.get_addresses().await?;

    let mut keys = HashMap::new();
    for address in addresses.iter().filter(|a| a.is_enabled()) {
        match crypto.unlock_address_keys(address) {
            Ok(key) => {
                keys.insert(address.id.clone(), key);
            }
            Err(err) => {
                warn!(address_id = %address.id, error = %err, "Failed to unlock address keys");
            }
        }
    }

    Ok((user, addresses, keys))
}

/// Identity shared behind a reader/writer lock.
#[derive(Clone)]
pub struct SharedIdentity {
    inner: Arc<RwLock<IdentityState>>,
}

impl SharedIdentity {
    pub fn new(state: IdentityState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, IdentityState> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, IdentityState> {
        self.inner.write()
    }

    pub fn snapshot(&self) -> IdentityState {
        self.inner.read().clone()
    }

    pub fn user_id(&self) -> String {
        self.inner.read().user.id.clone()
    }
}

impl std::fmt::Debug for SharedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.read().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::AddressStatus;

    fn address(id: &str, email: &str, order: u32, status: AddressStatus) -> Address {
        Address {
            id: id.into(),
            email: email.into(),
            status,
            order,
        }
    }

    fn user() -> User {
        User {
            id: "u1".into(),
            name: "user".into(),
            display_name: "User".into(),
            used_space: 0,
            max_space: 0,
        }
    }

    fn state() -> IdentityState {
        IdentityState::new(
            user(),
            vec![
                address("a2", "second@pm.me", 2, AddressStatus::Enabled),
                address("a1", "first@pm.me", 1, AddressStatus::Enabled),
            ],
            HashMap::new(),
            b"bridge-pass",
        )
    }

    #[test]
    fn test_primary_is_lowest_order() {
        assert_eq!(state().primary_address().unwrap().id, "a1");
    }

    #[test]
    fn test_strip_plus_alias() {
        assert_eq!(strip_plus_alias("me+news@pm.me"), "me@pm.me");
        assert_eq!(strip_plus_alias("+me@pm.me"), "+me@pm.me");
        assert_eq!(strip_plus_alias("me@pm+x.me"), "me@pm+x.me");
        assert!(equal_addresses("Me+Tag@PM.me", "me@pm.me"));
    }

    #[test]
    fn test_check_auth() {
        let state = state();
        let encoded = STANDARD.encode(b"bridge-pass");

        assert_eq!(
            state.check_auth("SECOND+x@pm.me", encoded.as_bytes()),
            Some("a2".to_string())
        );
        assert_eq!(state.check_auth("second@pm.me", b"bm9wZQ=="), None);
        assert_eq!(state.check_auth("other@pm.me", encoded.as_bytes()), None);
        assert_eq!(state.check_auth("second@pm.me", b"not base64!"), None);
    }

    #[test]
    fn test_address_lifecycle() {
        let mut state = state();

        let disabled = address("a3", "third@pm.me", 3, AddressStatus::Disabled);
        assert_eq!(state.on_address_created(disabled.clone(), None), AddressUpdate::Noop);
        assert_eq!(state.on_address_created(disabled, None), AddressUpdate::Noop);

        let enabled = address("a3", "third@pm.me", 3, AddressStatus::Enabled);
        assert_eq!(state.on_address_updated(enabled.clone(), None), AddressUpdate::Enabled);
        assert_eq!(state.on_address_updated(enabled, None), AddressUpdate::Updated);

        let disabled = address("a3", "third@pm.me", 0, AddressStatus::Disabled);
        assert_eq!(state.on_address_updated(disabled, None), AddressUpdate::Disabled);
        assert_eq!(state.primary_address().unwrap().id, "a3");

        let (removed, update) = state.on_address_deleted("a3");
        assert_eq!(update, AddressUpdate::Noop);
        assert!(removed.is_none());

        let (removed, update) = state.on_address_deleted("a2");
        assert_eq!(update, AddressUpdate::Deleted);
        assert_eq!(removed.unwrap().id, "a2");
        assert_eq!(state.on_address_deleted("missing").1, AddressUpdate::Noop);
    }

    #[test]
    fn test_updated_unknown_address_is_created() {
        let mut state = state();
        let new = address("a9", "nine@pm.me", 9, AddressStatus::Enabled);
        assert_eq!(state.on_address_updated(new, None), AddressUpdate::Created);
    }
}
