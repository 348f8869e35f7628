mod local_documents_view;
mod local_serializer;
mod local_store;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;

pub use local_documents_view::LocalDocumentsView;
pub use local_serializer::{DbMutationQueue, DbTargetGlobal, DbTimestamp, LocalSerializer};
pub use local_store::{
    LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
pub use mutation_queue::MutationQueue;
pub use persistence::{
    FailingStorageEngine, MemoryStorageEngine, Persistence, PersistenceTransaction,
    StorageEngine, StorageRecord, StorageWrite, StoreName, TransactionMode,
};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{
    RemoteDocumentCache, RemoteDocumentChangeBuffer, RemoteDocumentEntry,
};
pub use target_cache::{QueryPurpose, TargetCache, TargetData};
