//! # Label Directory
//!
//! Process-wide view of the account's remote labels, keyed by label id.
//!
//! Readers take a [`LabelsRead`] guard and writers a [`LabelsWrite`] guard.
//! Both wrap `parking_lot` guards, which are `!Send`: holding one across an
//! `.await` inside a spawned task does not compile, so a guard can never span
//! a network call or a local-store round trip. Guards are released on drop or
//! explicitly with `release()`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bridge_traits::{LabelKind, RemoteLabel};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type LabelMap = HashMap<String, RemoteLabel>;

#[derive(Clone, Default)]
pub struct LabelDirectory {
    inner: Arc<RwLock<LabelMap>>,
}

impl LabelDirectory {
    pub fn new(labels: impl IntoIterator<Item = RemoteLabel>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(
                labels.into_iter().map(|l| (l.id.clone(), l)).collect(),
            )),
        }
    }

    pub fn read(&self) -> LabelsRead<'_> {
        LabelsRead {
            guard: self.inner.read(),
        }
    }

    pub fn write(&self) -> LabelsWrite<'_> {
        LabelsWrite {
            guard: self.inner.write(),
        }
    }

    /// Copy of a single label.
    pub fn get(&self, id: &str) -> Option<RemoteLabel> {
        self.read().get(id).cloned()
    }

    /// Copy of the whole directory.
    pub fn snapshot(&self) -> LabelMap {
        self.read().guard.clone()
    }
}

impl std::fmt::Debug for LabelDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelDirectory")
            .field("labels", &self.inner.read().len())
            .finish()
    }
}

pub struct LabelsRead<'a> {
    guard: RwLockReadGuard<'a, LabelMap>,
}

impl LabelsRead<'_> {
    pub fn get(&self, id: &str) -> Option<&RemoteLabel> {
        self.guard.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.guard.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteLabel> {
        self.guard.values()
    }

    /// Find a label of `kind` by its full path.
    pub fn by_path(&self, kind: LabelKind, path: &[String]) -> Option<&RemoteLabel> {
        self.guard
            .values()
            .find(|label| label.kind == kind && label.path == path)
    }

    /// The label and all of its descendants, breadth first.
    pub fn with_descendants(&self, id: &str) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::from([id.to_string()]);
        let mut queue = VecDeque::from([id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for label in self.guard.values() {
                if label.parent_id.as_deref() == Some(current.as_str())
                    && seen.insert(label.id.clone())
                {
                    queue.push_back(label.id.clone());
                }
            }
            ordered.push(current);
        }

        ordered
    }

    pub fn release(self) {}
}

pub struct LabelsWrite<'a> {
    guard: RwLockWriteGuard<'a, LabelMap>,
}

impl LabelsWrite<'_> {
    pub fn get(&self, id: &str) -> Option<&RemoteLabel> {
        self.guard.get(id)
    }

    /// Insert or replace a label.
    pub fn set(&mut self, label: RemoteLabel) {
        self.guard.insert(label.id.clone(), label);
    }

    pub fn remove(&mut self, id: &str) -> Option<RemoteLabel> {
        self.guard.remove(id)
    }

    pub fn replace_all(&mut self, labels: impl IntoIterator<Item = RemoteLabel>) {
        self.guard.clear();
        self.guard
            .extend(labels.into_iter().map(|l| (l.id.clone(), l)));
    }

    pub fn release(self) {}
}
