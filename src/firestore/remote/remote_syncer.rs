use crate::firestore::core::TargetId;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{
    BatchId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion,
};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

/// Local state the remote store reads while handling stream traffic.
///
/// Implemented by the sync engine over a borrow of its local store, so the
/// remote store never owns client state.
pub trait RemoteSyncer {
    /// Keys the client currently considers part of the target on the server.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// The first queued batch after `after_batch_id`, or the first batch.
    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> Option<MutationBatch>;

    fn last_stream_token(&self) -> Vec<u8>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}

/// Outcome of remote traffic that the sync engine has to apply.
#[derive(Debug, Clone)]
pub enum RemoteStoreEvent {
    RemoteEvent(RemoteEvent),
    ListenRejected {
        target_id: TargetId,
        error: FirestoreError,
    },
    /// The head batch left the write pipeline. The syncer refills the
    /// pipeline once the batch is out of its mutation queue.
    WriteAcknowledged(MutationBatchResult),
    WriteRejected {
        batch_id: BatchId,
        error: FirestoreError,
    },
    OnlineStateChanged(OnlineState),
    /// The write stream token changed and should be persisted.
    StreamTokenChanged(Vec<u8>),
}
