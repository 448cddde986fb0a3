use crate::codec::CodecError;
use crate::diff::TextDiff;
use crate::k8s::{Cluster, ClusterError};
use crate::model::{Object, ObjectKey, ResourceKind};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("Error decoding object: {0}")]
    Decode(String),

    #[error("Error getting current object {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: ClusterError,
    },

    #[error("Error encoding current object: {0}")]
    Encode(#[source] CodecError),

    #[error("Error creating object {key}: {source}")]
    Create {
        key: String,
        #[source]
        source: ClusterError,
    },

    #[error("Error updating object {key}: {source}")]
    Update {
        key: String,
        #[source]
        source: ClusterError,
    },

    #[error("{0} was changed by someone else since it was loaded; reload it and reapply your edits")]
    Conflict(String),

    #[error("{key} was saved but reloading it failed: {source}")]
    Refresh {
        key: String,
        #[source]
        source: ClusterError,
    },
}

impl EditError {
    /// False when the failure left the server untouched.
    pub fn server_may_have_changed(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Refresh { .. })
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    /// The object did not exist and was created.
    Created(Object),
    /// The object exists; the update waits for confirmation.
    Review(PendingEdit),
}

/// Saves edited object text against the cluster.
#[derive(Clone)]
pub struct ObjectEditor {
    cluster: Arc<Cluster>,
}

impl ObjectEditor {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// Decodes the text and compares it with the live object. Creates the
    /// object right away when the server has no such object.
    pub async fn save(&self, text: &str) -> Result<SaveOutcome, EditError> {
        let edited = self
            .cluster
            .codec
            .decode(text)
            .map_err(|error| EditError::Decode(error.to_string()))?;
        let kind = self.kind_of(&edited)?;
        let key = ObjectKey::of(&edited);

        let current = self
            .cluster
            .api()
            .get(&kind, &key)
            .await
            .map_err(|source| EditError::Fetch {
                key: key.to_string(),
                source,
            })?;

        let Some(current) = current else {
            return self.create(&kind, &key, edited).await.map(SaveOutcome::Created);
        };

        let current_text = self
            .cluster
            .codec
            .encode(&current)
            .map_err(EditError::Encode)?;
        let diff = TextDiff::compute(&current_text, text);
        debug!(object = %key, changed = diff.has_changes(), "prepared edit for review");

        Ok(SaveOutcome::Review(PendingEdit {
            cluster: Arc::clone(&self.cluster),
            kind,
            key,
            current,
            edited,
            diff,
        }))
    }

    async fn create(
        &self,
        kind: &ResourceKind,
        key: &ObjectKey,
        object: Object,
    ) -> Result<Object, EditError> {
        let created = self
            .cluster
            .api()
            .create(kind, &object)
            .await
            .map_err(|source| EditError::Create {
                key: key.to_string(),
                source,
            })?;
        info!(object = %key, %kind, "object created");

        let key = ObjectKey::of(&created);
        refetch(&self.cluster, kind, &key, created).await
    }

    fn kind_of(&self, object: &Object) -> Result<ResourceKind, EditError> {
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| EditError::Decode("apiVersion and kind are required".to_string()))?;
        self.cluster
            .resource_for(&types.api_version, &types.kind)
            .cloned()
            .ok_or_else(|| {
                EditError::Decode(format!(
                    "the cluster does not serve {} {}",
                    types.api_version, types.kind
                ))
            })
    }
}

/// An update awaiting the user's decision.
pub struct PendingEdit {
    cluster: Arc<Cluster>,
    kind: ResourceKind,
    key: ObjectKey,
    current: Object,
    edited: Object,
    diff: TextDiff,
}

impl std::fmt::Debug for PendingEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEdit")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("diff", &self.diff)
            .finish_non_exhaustive()
    }
}

impl PendingEdit {
    pub fn diff(&self) -> &TextDiff {
        &self.diff
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn summary(&self) -> String {
        format!(
            "Saving {}: {} line(s) removed, {} line(s) added",
            self.key,
            self.diff.removed().len(),
            self.diff.added().len()
        )
    }

    /// Discards the edit without touching the cluster.
    pub fn cancel(self) {
        debug!(object = %self.key, "edit cancelled");
    }

    /// Submits the update and returns the object as the server now stores it.
    ///
    /// The resource version from the edited text is sent as is, so a change
    /// made by someone else after loading fails with [`EditError::Conflict`].
    pub async fn apply(self) -> Result<Object, EditError> {
        let mut edited = self.edited;
        if edited.metadata.resource_version.is_none() {
            edited.metadata.resource_version = self.current.metadata.resource_version.clone();
        }

        let updated = self
            .cluster
            .api()
            .update(&self.kind, &edited)
            .await
            .map_err(|source| match source {
                ClusterError::Conflict(_) => EditError::Conflict(self.key.to_string()),
                source => EditError::Update {
                    key: self.key.to_string(),
                    source,
                },
            })?;
        info!(object = %self.key, kind = %self.kind, "object updated");

        refetch(&self.cluster, &self.kind, &self.key, updated).await
    }
}

async fn refetch(
    cluster: &Cluster,
    kind: &ResourceKind,
    key: &ObjectKey,
    fallback: Object,
) -> Result<Object, EditError> {
    let refreshed = cluster
        .api()
        .get(kind, key)
        .await
        .map_err(|source| EditError::Refresh {
            key: key.to_string(),
            source,
        })?;
    Ok(refreshed.unwrap_or(fallback))
}
