mod event_manager;
mod firestore_client;
mod query;
mod sync_engine;
mod target_id_generator;
mod transaction;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, SnapshotObserver};
pub use firestore_client::{FirestoreClient, ListenerRegistration};
pub use query::{
    Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query, Target,
};
pub use sync_engine::SyncEngine;
pub use target_id_generator::{TargetId, TargetIdGenerator};
pub use transaction::{run_transaction, Transaction};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
