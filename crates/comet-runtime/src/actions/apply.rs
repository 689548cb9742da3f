use crate::error::ExecutionError;
use comet_config::TagConfig;
use comet_core::{ActionKind, ActionPayload, ActionRequest, MessageId, MoveDestination};
use comet_storage::{StorageError, WriteTransaction};
use std::collections::{BTreeMap, BTreeSet};

/// Applies a resolved request inside `tx` and returns the request that
/// reverses exactly the changes made, if any were made.
pub(crate) async fn apply(
    tx: &mut dyn WriteTransaction,
    request: &ActionRequest,
    tags: &TagConfig,
) -> Result<Option<ActionRequest>, ExecutionError> {
    let undo = match &request.payload {
        ActionPayload::Tag { tag } => {
            let changed = add_tag(tx, &request.targets, tag).await?;
            inverse(changed, |ids| ActionRequest::untag(ids, tag.clone()))
        }
        ActionPayload::Untag { tag } => {
            let changed = remove_tag(tx, &request.targets, tag).await?;
            inverse(changed, |ids| ActionRequest::tag(ids, tag.clone()))
        }
        ActionPayload::MarkRead => {
            let changed = remove_tag(tx, &request.targets, &tags.unread).await?;
            inverse(changed, |ids| ActionRequest::tag(ids, tags.unread.clone()))
        }
        ActionPayload::Archive => {
            let changed = remove_tag(tx, &request.targets, &tags.inbox).await?;
            inverse(changed, |ids| ActionRequest::tag(ids, tags.inbox.clone()))
        }
        ActionPayload::Delete => {
            let changed = add_tag(tx, &request.targets, &tags.deleted).await?;
            inverse(changed, |ids| ActionRequest::untag(ids, tags.deleted.clone()))
        }
        ActionPayload::Move { destination } => {
            let mut previous = BTreeMap::new();
            for id in &request.targets {
                let folder = match destination {
                    MoveDestination::Folder(folder) => Some(folder),
                    MoveDestination::PerMessage(folders) => folders.get(id),
                };
                let Some(folder) = folder else { continue };
                if let Some(old) = tx.set_folder(id, folder).await? {
                    previous.insert(id.clone(), old);
                }
            }
            (!previous.is_empty()).then(|| {
                ActionRequest::new(
                    ActionKind::Move,
                    previous.keys().cloned().collect(),
                    ActionPayload::Move {
                        destination: MoveDestination::PerMessage(previous),
                    },
                )
            })
        }
        ActionPayload::Send { .. } => {
            add_tag(tx, &request.targets, &tags.replied).await?;
            None
        }
        ActionPayload::Revert { of } => return Err(ExecutionError::NothingToRevert(*of)),
    };
    Ok(undo)
}

/// The kind an undo of `kind` will have, known before the action ran.
pub(crate) fn inverse_kind(kind: ActionKind) -> Option<ActionKind> {
    match kind {
        ActionKind::Tag | ActionKind::Delete => Some(ActionKind::Untag),
        ActionKind::Untag | ActionKind::MarkRead | ActionKind::Archive => Some(ActionKind::Tag),
        ActionKind::Move => Some(ActionKind::Move),
        ActionKind::Send => None,
    }
}

async fn add_tag(
    tx: &mut dyn WriteTransaction,
    targets: &BTreeSet<MessageId>,
    tag: &str,
) -> Result<BTreeSet<MessageId>, StorageError> {
    let mut changed = BTreeSet::new();
    for id in targets {
        if tx.add_tag(id, tag).await? {
            changed.insert(id.clone());
        }
    }
    Ok(changed)
}

async fn remove_tag(
    tx: &mut dyn WriteTransaction,
    targets: &BTreeSet<MessageId>,
    tag: &str,
) -> Result<BTreeSet<MessageId>, StorageError> {
    let mut changed = BTreeSet::new();
    for id in targets {
        if tx.remove_tag(id, tag).await? {
            changed.insert(id.clone());
        }
    }
    Ok(changed)
}

fn inverse(
    changed: BTreeSet<MessageId>,
    build: impl FnOnce(BTreeSet<MessageId>) -> ActionRequest,
) -> Option<ActionRequest> {
    (!changed.is_empty()).then(|| build(changed))
}
