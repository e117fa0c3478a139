//! # Local-Store Handle
//!
//! Indirection to the local protocol server's store. Attaching and closing
//! take the writer role; every use takes the reader role for its whole
//! duration and fails fast with [`BridgeError::StoreClosed`] when no store is
//! attached, so a close never races an in-flight lookup.

use std::future::Future;
use std::sync::Arc;

use bridge_traits::{BridgeError, LocalStore, StoredMailbox};
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<RwLock<Option<Arc<dyn LocalStore>>>>,
}

impl StoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, store: Arc<dyn LocalStore>) {
        *self.inner.write().await = Some(store);
    }

    /// Detach the store. Waits for in-flight readers to finish.
    pub async fn close(&self) {
        self.inner.write().await.take();
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Run `f` against the attached store while holding the reader role.
    pub async fn read<F, Fut, T>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Arc<dyn LocalStore>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let guard = self.inner.read().await;
        let store = guard.as_ref().cloned().ok_or(BridgeError::StoreClosed)?;
        let result = f(store).await;
        drop(guard);
        result
    }

    pub async fn mailbox_by_name(&self, name: &[String]) -> Result<Option<StoredMailbox>, BridgeError> {
        self.read(|store| async move { store.mailbox_by_name(name).await })
            .await
    }

    pub async fn mailbox_message_count(&self, mailbox: &StoredMailbox) -> Result<usize, BridgeError> {
        self.read(|store| async move { store.mailbox_message_count(mailbox).await })
            .await
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}
