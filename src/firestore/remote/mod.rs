pub mod connection;
pub mod credentials;
pub mod datastore;
mod online_state_tracker;
mod persistent_stream;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod serializer;
mod watch_change;
mod watch_change_aggregator;

pub use connection::{
    ChannelConnection, ChannelServer, Connection, MockConnection, MockStream, ServerEvent,
    ServerStream, StreamKind, StreamListener, TransportStream,
};
pub use credentials::{
    AuthToken, CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, User,
    UserChangeListener,
};
pub use datastore::{Datastore, FakeDatastore};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{
    PersistentStream, RemoteInput, RemoteInputHandler, RemoteScheduler, RemoteTimer, StreamEvent,
    StreamSignal, StreamState, WatchStream, WriteStream, WriteStreamResponse,
};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore};
pub use remote_syncer::{RemoteStoreEvent, RemoteSyncer};
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use watch_change::{
    decode_watch_change, DocumentWatchChange, ExistenceFilterChange, WatchChange,
    WatchTargetChange, WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
