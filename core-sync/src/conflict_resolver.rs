//! # Label Conflict Resolution
//!
//! Decides which local mailbox operations make a remote label's mailbox name
//! available to it.
//!
//! ## Overview
//!
//! A local mailbox name may still be held by another label, e.g. after two
//! folders swapped names on the remote while the bridge was offline. The
//! resolver walks the chain of occupants, asking the remote for each
//! occupant's current state:
//!
//! - **Free name**: create or rename the mailbox in place
//! - **Same label**: nothing to do
//! - **Occupant gone remotely**: delete its mailbox, then take the name
//! - **Occupant renamed remotely**: move the occupant first (recursively),
//!   then take the name
//! - **Occupant unchanged**: irreconcilable, reported and returned as
//!   [`SyncError::LabelConflict`]
//!
//! Cycles (A→B→…→A) are broken by renaming the first label to a temporary
//! name; the final update of the outermost call overwrites it.
//!
//! Resolution only produces an [`UpdateThunk`]. Calling it yields a fresh
//! list of updates each time, so the same resolution can be replayed on
//! every connector.
//!
//! ## Usage
//!
//! ```no_run
//! use std::collections::HashSet;
//! use core_sync::conflict_resolver::LabelConflictResolver;
//! use bridge_traits::RemoteLabel;
//!
//! # async fn example(resolver: &dyn LabelConflictResolver, label: RemoteLabel) -> core_sync::Result<()> {
//! let mut visited = HashSet::new();
//! let updates = resolver.resolve(&label, &mut visited).await?;
//! for update in updates() {
//!     println!("{update}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::telemetry::report_context;
use bridge_traits::{
    BridgeError, LabelKind, RemoteApi, RemoteLabel, StoredMailbox, Telemetry, Update,
};
use core_runtime::config::FeatureFlags;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};
use crate::labels::LabelMap;
use crate::mailbox::{
    hash_label_path, mailbox_name, mailbox_name_with_temp_prefix, mailbox_updated_or_created,
    FOLDER_PREFIX, LABEL_PREFIX,
};
use crate::store_handle::StoreHandle;

/// Deferred list of updates produced by a resolution.
pub type UpdateThunk = Arc<dyn Fn() -> Vec<Update> + Send + Sync>;

pub fn empty_thunk() -> UpdateThunk {
    Arc::new(Vec::new)
}

/// Concatenate thunks in order.
pub fn combine(thunks: Vec<UpdateThunk>) -> UpdateThunk {
    Arc::new(move || thunks.iter().flat_map(|thunk| thunk()).collect())
}

fn single(make: impl Fn() -> Vec<Update> + Send + Sync + 'static) -> UpdateThunk {
    Arc::new(make)
}

/// Mailbox lookups against the local store.
#[async_trait]
pub trait MailboxLookup: Send + Sync {
    async fn mailbox_by_name(&self, name: &[String]) -> Result<Option<StoredMailbox>>;

    /// Number of messages in `mailbox` summed over every store.
    async fn mailbox_message_count(&self, mailbox: &StoredMailbox) -> Result<usize>;
}

/// Lookups through the store handles of the account's connectors.
///
/// Names are resolved on the first open store; message counts are summed
/// over all of them.
#[derive(Debug, Clone, Default)]
pub struct ConnectorStores {
    handles: Vec<StoreHandle>,
}

impl ConnectorStores {
    pub fn new(handles: Vec<StoreHandle>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[async_trait]
impl MailboxLookup for ConnectorStores {
    async fn mailbox_by_name(&self, name: &[String]) -> Result<Option<StoredMailbox>> {
        for handle in &self.handles {
            match handle.mailbox_by_name(name).await {
                Err(BridgeError::StoreClosed) => continue,
                result => return Ok(result?),
            }
        }

        Err(SyncError::NoConnector)
    }

    async fn mailbox_message_count(&self, mailbox: &StoredMailbox) -> Result<usize> {
        let mut total = 0;
        let mut first_error = None;

        for handle in &self.handles {
            match handle.mailbox_message_count(mailbox).await {
                Ok(count) => total += count,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if total == 0 => Err(err.into()),
            _ => Ok(total),
        }
    }
}

/// Resolves the mailbox name of one user label.
#[async_trait]
pub trait LabelConflictResolver: Send + Sync {
    /// `visited` holds the label ids already on the current resolution
    /// chain and must be fresh for every top-level call.
    async fn resolve(
        &self,
        label: &RemoteLabel,
        visited: &mut HashSet<String>,
    ) -> Result<UpdateThunk>;
}

/// Resolver used when conflict resolution is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLabelConflictResolver;

#[async_trait]
impl LabelConflictResolver for NullLabelConflictResolver {
    async fn resolve(
        &self,
        _label: &RemoteLabel,
        _visited: &mut HashSet<String>,
    ) -> Result<UpdateThunk> {
        Ok(empty_thunk())
    }
}

pub struct UserLabelConflictResolver {
    lookup: Arc<dyn MailboxLookup>,
    api: Arc<dyn RemoteApi>,
    telemetry: Arc<dyn Telemetry>,
}

impl UserLabelConflictResolver {
    pub fn new(
        lookup: Arc<dyn MailboxLookup>,
        api: Arc<dyn RemoteApi>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            lookup,
            api,
            telemetry,
        }
    }
}

fn take_name(label: &RemoteLabel) -> UpdateThunk {
    let id = label.id.clone();
    let name = mailbox_name(label);
    single(move || vec![mailbox_updated_or_created(&id, name.clone())])
}

#[async_trait]
impl LabelConflictResolver for UserLabelConflictResolver {
    async fn resolve(
        &self,
        label: &RemoteLabel,
        visited: &mut HashSet<String>,
    ) -> Result<UpdateThunk> {
        let name = mailbox_name(label);
        let label_path = hash_label_path(&name);

        if !visited.insert(label.id.clone()) {
            info!(label_id = %label.id, label_path = %label_path, "Cycle detected, applying temporary rename");
            let id = label.id.clone();
            let temp = mailbox_name_with_temp_prefix(label);
            return Ok(single(move || {
                vec![mailbox_updated_or_created(&id, temp.clone())]
            }));
        }

        let Some(occupant) = self.lookup.mailbox_by_name(&name).await? else {
            info!(label_id = %label.id, label_path = %label_path, "Mailbox name is free");
            return Ok(take_name(label));
        };

        if occupant.remote_id == label.id {
            return Ok(empty_thunk());
        }

        info!(
            label_id = %label.id,
            label_path = %label_path,
            conflicting_label_id = %occupant.remote_id,
            conflicting_label_path = %hash_label_path(&occupant.name),
            "Label conflict found"
        );

        let conflicting = match self
            .api
            .get_label(&occupant.remote_id, &LabelKind::EXPOSED)
            .await
        {
            Ok(conflicting) => conflicting,
            Err(err) if err.is_not_found() => {
                info!(conflicting_label_id = %occupant.remote_id, "Conflicting label no longer exists remotely, deleting");
                let stale = occupant.remote_id.clone();
                let id = label.id.clone();
                return Ok(single(move || {
                    vec![
                        Update::MailboxDeleted {
                            id: stale.clone(),
                            silent: false,
                        },
                        mailbox_updated_or_created(&id, name.clone()),
                    ]
                }));
            }
            Err(err) => {
                error!(conflicting_label_id = %occupant.remote_id, error = %err, "Failed to fetch conflicting label");
                return Err(err.into());
            }
        };

        if mailbox_name(&conflicting).concat() == occupant.name.concat() {
            let context = report_context([
                ("labelID", label.id.as_str()),
                ("conflictingLabelID", conflicting.id.as_str()),
            ]);
            if let Err(err) = self
                .telemetry
                .report_message("Unexpected label conflict", context)
            {
                error!(error = %err, "Failed to report label conflict");
            }

            return Err(SyncError::LabelConflict {
                label_id: label.id.clone(),
                conflicting_id: conflicting.id,
            });
        }

        info!(
            conflicting_label_id = %conflicting.id,
            conflicting_label_new_path = %hash_label_path(&conflicting.path),
            "Conflicting label was renamed, resolving recursively"
        );
        let moved = self.resolve(&conflicting, visited).await?;

        Ok(combine(vec![moved, take_name(label)]))
    }
}

/// Frees the placeholder mailbox names (`Folders`, `Labels`) before labels
/// are synced.
#[async_trait]
pub trait InternalLabelConflictResolver: Send + Sync {
    async fn resolve(&self, api_labels: &LabelMap) -> Result<UpdateThunk>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullInternalLabelConflictResolver;

#[async_trait]
impl InternalLabelConflictResolver for NullInternalLabelConflictResolver {
    async fn resolve(&self, _api_labels: &LabelMap) -> Result<UpdateThunk> {
        Ok(empty_thunk())
    }
}

pub struct PlaceholderConflictResolver {
    lookup: Arc<dyn MailboxLookup>,
    user_resolver: Arc<dyn LabelConflictResolver>,
    telemetry: Arc<dyn Telemetry>,
    allow_non_empty_mailbox_deletion: bool,
}

impl PlaceholderConflictResolver {
    pub fn new(
        lookup: Arc<dyn MailboxLookup>,
        user_resolver: Arc<dyn LabelConflictResolver>,
        telemetry: Arc<dyn Telemetry>,
        allow_non_empty_mailbox_deletion: bool,
    ) -> Self {
        Self {
            lookup,
            user_resolver,
            telemetry,
            allow_non_empty_mailbox_deletion,
        }
    }

    fn report(&self, warning: bool, message: &str, context: bridge_traits::ReportContext) {
        let result = if warning {
            self.telemetry.report_warning(message, context)
        } else {
            self.telemetry.report_message(message, context)
        };
        if let Err(err) = result {
            error!(error = %err, "Failed to send report");
        }
    }
}

#[async_trait]
impl InternalLabelConflictResolver for PlaceholderConflictResolver {
    async fn resolve(&self, api_labels: &LabelMap) -> Result<UpdateThunk> {
        let mut thunks = Vec::new();

        for prefix in [FOLDER_PREFIX, LABEL_PREFIX] {
            let placeholder = vec![prefix.to_string()];

            let Some(occupant) = self.lookup.mailbox_by_name(&placeholder).await? else {
                continue;
            };
            if occupant.remote_id == prefix {
                continue;
            }

            let occupant_name = occupant.name.join("/");
            let mut context = report_context([
                ("internalLabelID", prefix),
                ("internalLabelName", prefix),
                ("conflictingLabelID", occupant.remote_id.as_str()),
                ("conflictingLabelName", occupant_name.as_str()),
            ]);
            info!(
                internal_label_id = prefix,
                conflicting_label_id = %occupant.remote_id,
                "Placeholder mailbox name is taken, resolving"
            );

            let Some(api_label) = api_labels.get(&occupant.remote_id) else {
                let count = self
                    .lookup
                    .mailbox_message_count(&occupant)
                    .await
                    .unwrap_or_default();

                if count != 0 {
                    warn!(
                        conflicting_label_id = %occupant.remote_id,
                        message_count = count,
                        "Conflicting non-API mailbox has messages"
                    );
                    context.insert("conflictingLabelMessageCount".into(), count.into());
                    self.report(
                        true,
                        "Internal mailbox name conflict. Conflicting non-API label has messages.",
                        context,
                    );

                    if !self.allow_non_empty_mailbox_deletion {
                        return Err(SyncError::InternalLabelConflict(
                            "internal mailbox conflicting non-api label has associated messages"
                                .into(),
                        ));
                    }
                }

                let stale = occupant.remote_id.clone();
                thunks.push(single(move || {
                    vec![Update::MailboxDeleted {
                        id: stale.clone(),
                        silent: true,
                    }]
                }));
                continue;
            };

            context.insert(
                "conflictingLabelType".into(),
                format!("{:?}", api_label.kind).into(),
            );

            let api_name = mailbox_name(api_label);
            if api_name.concat() == placeholder.concat() {
                error!(internal_label_id = prefix, "Same-name mailbox is returned by the API");
                self.report(
                    false,
                    "Internal mailbox name conflict. Same-name mailbox is returned by API",
                    context,
                );
                return Err(SyncError::InternalLabelConflict(format!(
                    "API label {} conflicts with internal label {occupant_name}",
                    api_name.join("/")
                )));
            }

            let mut visited = HashSet::new();
            match self.user_resolver.resolve(api_label, &mut visited).await {
                Ok(thunk) => thunks.push(thunk),
                Err(err) => {
                    context.insert("err".into(), err.to_string().into());
                    self.report(false, "Failed to resolve internal mailbox conflict", context);
                    return Err(SyncError::InternalLabelConflict(format!(
                        "failed to resolve user label conflict for '{}': {err}",
                        api_label.name
                    )));
                }
            }
        }

        Ok(combine(thunks))
    }
}

/// Builds resolvers for the current set of connectors, honouring the
/// resolver feature flags.
#[derive(Clone)]
pub struct LabelConflictManager {
    api: Arc<dyn RemoteApi>,
    telemetry: Arc<dyn Telemetry>,
    features: FeatureFlags,
}

impl LabelConflictManager {
    pub fn new(api: Arc<dyn RemoteApi>, telemetry: Arc<dyn Telemetry>, features: FeatureFlags) -> Self {
        Self {
            api,
            telemetry,
            features,
        }
    }

    pub fn resolver(&self, lookup: Arc<dyn MailboxLookup>) -> Arc<dyn LabelConflictResolver> {
        if self.features.disable_label_conflict_resolver {
            return Arc::new(NullLabelConflictResolver);
        }

        Arc::new(UserLabelConflictResolver::new(
            lookup,
            self.api.clone(),
            self.telemetry.clone(),
        ))
    }

    pub fn internal_resolver(
        &self,
        lookup: Arc<dyn MailboxLookup>,
    ) -> Arc<dyn InternalLabelConflictResolver> {
        if self.features.disable_internal_label_conflict_resolver {
            return Arc::new(NullInternalLabelConflictResolver);
        }

        Arc::new(PlaceholderConflictResolver::new(
            lookup.clone(),
            self.resolver(lookup),
            self.telemetry.clone(),
            self.features.allow_non_empty_mailbox_deletion,
        ))
    }
}

impl std::fmt::Debug for LabelConflictManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelConflictManager")
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}
