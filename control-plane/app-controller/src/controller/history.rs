//! Revision history of an Application's resource templates.
//!
//! Each distinct template set is captured once as a `ControllerRevision`
//! named `<app>-<hash>`. Sequence numbers (`.revision`) order history in
//! time; the content hash only identifies it. Concurrent writers may leave
//! duplicates behind, which the next pass collapses onto the newest one.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::canonical::{canonical_bytes, canonical_payload, content_hash, revision_document};
use crate::crd::Application;
use crate::store::{ObjectKey, Session, StoreError, TypeKey, from_dynamic, to_dynamic};

pub const REVISION_HASH_LABEL: &str = "controller-revision-hash";
pub const REVISION_NAME_LABEL: &str = "applications.app.io/revision-name";
/// Carries the owning Application's uid; names may be longer than a label value allows.
pub const APPLICATION_UID_LABEL: &str = "applications.app.io/application-uid";

const MAX_LABEL_VALUE: usize = 63;

pub fn revision_type() -> TypeKey {
    TypeKey::new("apps/v1", "ControllerRevision")
}

#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("failed to serialize spec for hashing: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("revision {0} already exists with different content")]
    Collision(String),
    #[error("Application {0} has no uid; cannot own revisions")]
    MissingOwner(String),
}

impl HistoryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HistoryError::Store(e) if e.is_cancelled())
    }
}

/// Immutable snapshot of one revision as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionSnapshot {
    pub name: String,
    pub namespace: String,
    pub sequence: i64,
    pub content_hash: String,
    /// Canonical bytes of the stored revision document.
    pub payload: Vec<u8>,
    pub owner_uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl RevisionSnapshot {
    fn from_revision(rev: &ControllerRevision) -> Result<Self, HistoryError> {
        let payload = match &rev.data {
            Some(RawExtension(v)) => canonical_bytes(v)?,
            None => Vec::new(),
        };
        let labels = rev.labels().clone();
        Ok(Self {
            name: rev.name_any(),
            namespace: rev.namespace().unwrap_or_default(),
            sequence: rev.revision,
            content_hash: labels
                .get(REVISION_HASH_LABEL)
                .cloned()
                .unwrap_or_default(),
            payload,
            owner_uid: controller_uid(&rev.metadata),
            resource_version: rev.resource_version(),
            labels,
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&revision_type(), &self.namespace, &self.name)
    }
}

/// Result of [`ensure_current_revision`].
#[derive(Debug, Clone)]
pub struct Revisions {
    pub current: RevisionSnapshot,
    /// Revisions whose content differs from the current spec.
    pub olds: Vec<RevisionSnapshot>,
}

fn controller_uid(meta: &ObjectMeta) -> Option<String> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.clone())
}

pub fn revision_name(app_name: &str, hash: &str) -> String {
    format!("{app_name}-{hash}")
}

/// Uniqueness label value for the revision `name` holding content `hash`.
/// Names too long for a label value keep their hash suffix and lose the tail of
/// the prefix.
pub fn revision_label(name: &str, hash: &str) -> String {
    if name.len() <= MAX_LABEL_VALUE {
        return name.to_string();
    }
    let keep = MAX_LABEL_VALUE.saturating_sub(hash.len() + 1);
    let prefix = name
        .get(..keep)
        .unwrap_or_default()
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{prefix}-{hash}")
}

fn next_sequence(olds: &[RevisionSnapshot]) -> i64 {
    olds.iter().map(|r| r.sequence).max().unwrap_or(0) + 1
}

/// Owned revisions, with the uniqueness label back-filled where missing.
async fn list_owned(
    session: &Session,
    app: &Application,
) -> Result<Vec<RevisionSnapshot>, HistoryError> {
    let ns = app.namespace().unwrap_or_default();
    let uid = app
        .uid()
        .ok_or_else(|| HistoryError::MissingOwner(app.name_any()))?;
    let selector = format!("{APPLICATION_UID_LABEL}={uid}");
    let mut out = Vec::new();
    for obj in session.list(&revision_type(), &ns, Some(&selector)).await? {
        let mut rev: ControllerRevision = from_dynamic(&obj)?;
        if controller_uid(&rev.metadata).as_deref() != Some(uid.as_str()) {
            continue;
        }
        let mut snapshot = RevisionSnapshot::from_revision(&rev)?;
        if !snapshot.labels.contains_key(REVISION_NAME_LABEL) {
            let hash = match snapshot.content_hash.as_str() {
                "" => content_hash(&snapshot.payload),
                hash => hash.to_string(),
            };
            let value = revision_label(&snapshot.name, &hash);
            rev.labels_mut().insert(REVISION_NAME_LABEL.to_string(), value);
            let mut updated = to_dynamic(&rev)?;
            updated.types = Some(revision_type().type_meta());
            let stored = session.update(&updated).await?;
            snapshot = RevisionSnapshot::from_revision(&from_dynamic(&stored)?)?;
            debug!(revision = %snapshot.name, "history: back-filled uniqueness label");
        }
        out.push(snapshot);
    }
    Ok(out)
}

/// Make sure a revision for the current template set exists.
///
/// Returns that revision together with every owned revision of different
/// content. Duplicates of the current content are deleted except the one
/// with the highest sequence number (ties go to the smallest name), whose
/// sequence is then bumped past all old revisions if it lags behind.
#[instrument(skip_all, fields(app = %app.name_any()))]
pub async fn ensure_current_revision(
    session: &Session,
    app: &Application,
) -> Result<Revisions, HistoryError> {
    let payload = canonical_payload(&app.spec)?;
    let (mut currents, olds): (Vec<_>, Vec<_>) = list_owned(session, app)
        .await?
        .into_iter()
        .partition(|r| r.payload == payload);
    let next = next_sequence(&olds);

    currents.sort_by(|a, b| {
        b.sequence.cmp(&a.sequence).then_with(|| a.name.cmp(&b.name))
    });
    let mut currents = currents.into_iter();
    let current = match currents.next() {
        None => snapshot(session, app, &payload, next).await?,
        Some(keep) => {
            delete_duplicates(session, &keep, currents).await?;
            if keep.sequence < next {
                bump(session, keep, next).await?
            } else {
                keep
            }
        }
    };
    Ok(Revisions { current, olds })
}

/// Create the revision for `payload`, accepting one an earlier writer already stored.
async fn snapshot(
    session: &Session,
    app: &Application,
    payload: &[u8],
    sequence: i64,
) -> Result<RevisionSnapshot, HistoryError> {
    let owner = app
        .controller_owner_ref(&())
        .ok_or_else(|| HistoryError::MissingOwner(app.name_any()))?;
    let hash = content_hash(payload);
    let name = revision_name(&app.name_any(), &hash);
    let ns = app.namespace().unwrap_or_default();

    let mut labels = app.labels().clone();
    labels.insert(REVISION_HASH_LABEL.to_string(), hash.clone());
    labels.insert(REVISION_NAME_LABEL.to_string(), revision_label(&name, &hash));
    labels.insert(APPLICATION_UID_LABEL.to_string(), owner.uid.clone());
    let annotations = app.annotations().clone();

    let rev = ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(ns.clone()),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(RawExtension(revision_document(&app.spec)?)),
        revision: sequence,
    };
    let mut obj = to_dynamic(&rev)?;
    obj.types = Some(revision_type().type_meta());

    match session.create(&obj).await {
        Ok(stored) => {
            info!(revision = %name, sequence, "history: created revision");
            RevisionSnapshot::from_revision(&from_dynamic(&stored)?)
        }
        Err(e) if e.is_already_exists() => {
            let key = ObjectKey::new(&revision_type(), &ns, &name);
            let Some(existing) = session.get(&key).await? else {
                return Err(e.into());
            };
            let existing = RevisionSnapshot::from_revision(&from_dynamic(&existing)?)?;
            if existing.payload == payload {
                debug!(revision = %name, "history: revision created concurrently; reusing");
                Ok(existing)
            } else {
                Err(HistoryError::Collision(name))
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete every duplicate of `keep`. Already-deleted duplicates are fine.
async fn delete_duplicates(
    session: &Session,
    keep: &RevisionSnapshot,
    duplicates: impl Iterator<Item = RevisionSnapshot>,
) -> Result<(), HistoryError> {
    for dup in duplicates {
        match session.delete(&dup.key()).await {
            Ok(()) => {
                info!(revision = %dup.name, kept = %keep.name, "history: deleted duplicate revision")
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn bump(
    session: &Session,
    keep: RevisionSnapshot,
    next: i64,
) -> Result<RevisionSnapshot, HistoryError> {
    let patch = json!({
        "metadata": { "resourceVersion": keep.resource_version },
        "revision": next,
    });
    let stored = session.patch_merge(&keep.key(), &patch).await?;
    info!(revision = %keep.name, from = keep.sequence, to = next, "history: bumped revision");
    RevisionSnapshot::from_revision(&from_dynamic(&stored)?)
}

/// Delete the oldest revisions so that at most `limit` of `olds` remain.
/// Returns the number of revisions removed.
#[instrument(skip_all, fields(olds = olds.len(), limit = limit))]
pub async fn cleanup(
    session: &Session,
    mut olds: Vec<RevisionSnapshot>,
    limit: usize,
) -> Result<usize, HistoryError> {
    if olds.len() <= limit {
        return Ok(0);
    }
    let to_kill = olds.len() - limit;
    olds.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    for rev in olds.iter().take(to_kill) {
        match session.delete(&rev.key()).await {
            Ok(()) => debug!(revision = %rev.name, sequence = rev.sequence, "history: pruned"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(revision = %rev.name, error = %e, "history: prune failed");
                return Err(e.into());
            }
        }
    }
    Ok(to_kill)
}
