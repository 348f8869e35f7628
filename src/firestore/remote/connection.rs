//! Abstract duplex streams to the backend and two in-process
//! implementations.
//!
//! [`MockConnection`] records everything a client sends and lets a test
//! drive the server side by hand. [`ChannelConnection`] frames client
//! messages over an `async_channel` to a [`ChannelServer`] that can run on
//! its own task.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::credentials::AuthToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Watch,
    Write,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Watch => "watch",
            StreamKind::Write => "write",
        }
    }
}

/// Receives the server side of a stream. Implementations must not block.
pub trait StreamListener: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, frame: Vec<u8>);
    /// Called once. `None` means the server closed the stream cleanly.
    fn on_close(&self, error: Option<FirestoreError>);
}

/// The client side of an open stream.
pub trait TransportStream: Send {
    fn send(&self, frame: Vec<u8>) -> FirestoreResult<()>;
    /// Closes the stream without notifying the listener.
    fn close(&self);
}

pub trait Connection: Send + Sync + 'static {
    fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<AuthToken>,
        listener: Arc<dyn StreamListener>,
    ) -> FirestoreResult<Box<dyn TransportStream>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MockStreamState {
    kind: StreamKind,
    token: Option<AuthToken>,
    listener: Arc<dyn StreamListener>,
    sent: Vec<Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
struct MockConnectionState {
    streams: Vec<Arc<Mutex<MockStreamState>>>,
    open_failures: Vec<FirestoreError>,
}

/// Connection double that records opened streams and sent frames.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockConnectionState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `open_stream` call fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        lock(&self.state).open_failures.push(error);
    }

    pub fn open_count(&self, kind: StreamKind) -> usize {
        lock(&self.state)
            .streams
            .iter()
            .filter(|stream| lock(stream).kind == kind)
            .count()
    }

    /// Most recently opened stream of `kind`.
    pub fn last_stream(&self, kind: StreamKind) -> Option<MockStream> {
        lock(&self.state)
            .streams
            .iter()
            .rev()
            .find(|stream| lock(stream).kind == kind)
            .map(|stream| MockStream {
                state: Arc::clone(stream),
            })
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("streams", &lock(&self.state).streams.len())
            .finish()
    }
}

impl Connection for MockConnection {
    fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<AuthToken>,
        listener: Arc<dyn StreamListener>,
    ) -> FirestoreResult<Box<dyn TransportStream>> {
        let mut state = lock(&self.state);
        if !state.open_failures.is_empty() {
            return Err(state.open_failures.remove(0));
        }
        let stream = Arc::new(Mutex::new(MockStreamState {
            kind,
            token,
            listener,
            sent: Vec::new(),
            closed: false,
        }));
        state.streams.push(Arc::clone(&stream));
        Ok(Box::new(MockTransportStream { state: stream }))
    }
}

struct MockTransportStream {
    state: Arc<Mutex<MockStreamState>>,
}

impl TransportStream for MockTransportStream {
    fn send(&self, frame: Vec<u8>) -> FirestoreResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(internal_error("send on a closed stream"));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

/// Server-side handle to one stream opened on a [`MockConnection`].
#[derive(Clone)]
pub struct MockStream {
    state: Arc<Mutex<MockStreamState>>,
}

impl MockStream {
    pub fn kind(&self) -> StreamKind {
        lock(&self.state).kind
    }

    pub fn token(&self) -> Option<AuthToken> {
        lock(&self.state).token.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Frames the client sent, decoded as JSON.
    pub fn sent(&self) -> Vec<JsonValue> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// Drops the frames recorded so far.
    pub fn take_sent(&self) -> Vec<JsonValue> {
        let frames = std::mem::take(&mut lock(&self.state).sent);
        frames
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    pub fn open(&self) {
        let listener = self.listener();
        listener.on_open();
    }

    pub fn respond(&self, message: JsonValue) {
        let listener = self.listener();
        listener.on_message(message.to_string().into_bytes());
    }

    /// Closes the stream from the server side.
    pub fn fail(&self, error: Option<FirestoreError>) {
        let listener = {
            let mut state = lock(&self.state);
            state.closed = true;
            Arc::clone(&state.listener)
        };
        listener.on_close(error);
    }

    fn listener(&self) -> Arc<dyn StreamListener> {
        Arc::clone(&lock(&self.state).listener)
    }
}

/// What a [`ChannelServer`] observes.
pub enum ServerEvent {
    Opened(ServerStream),
    Message { stream_id: u32, frame: JsonValue },
    Closed { stream_id: u32 },
}

/// Server-side end of a stream opened on a [`ChannelConnection`].
#[derive(Clone)]
pub struct ServerStream {
    id: u32,
    kind: StreamKind,
    token: Option<AuthToken>,
    listener: Arc<dyn StreamListener>,
    closed: Arc<AtomicBool>,
}

impl ServerStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn token(&self) -> Option<&AuthToken> {
        self.token.as_ref()
    }

    pub fn accept(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.listener.on_open();
        }
    }

    pub fn send(&self, message: JsonValue) {
        if !self.closed.load(Ordering::SeqCst) {
            self.listener.on_message(message.to_string().into_bytes());
        }
    }

    pub fn close(&self, error: Option<FirestoreError>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.listener.on_close(error);
        }
    }
}

/// Client side of an in-process channel transport.
#[derive(Clone)]
pub struct ChannelConnection {
    events: Sender<ServerEvent>,
    next_stream_id: Arc<AtomicU32>,
}

/// Receives the streams and frames of a [`ChannelConnection`].
pub struct ChannelServer {
    events: Receiver<ServerEvent>,
}

impl ChannelConnection {
    pub fn pair() -> (ChannelConnection, ChannelServer) {
        let (sender, receiver) = async_channel::unbounded();
        (
            ChannelConnection {
                events: sender,
                next_stream_id: Arc::new(AtomicU32::new(1)),
            },
            ChannelServer { events: receiver },
        )
    }
}

impl Connection for ChannelConnection {
    fn open_stream(
        &self,
        kind: StreamKind,
        token: Option<AuthToken>,
        listener: Arc<dyn StreamListener>,
    ) -> FirestoreResult<Box<dyn TransportStream>> {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));
        let server_stream = ServerStream {
            id,
            kind,
            token,
            listener,
            closed: Arc::clone(&closed),
        };
        self.events
            .try_send(ServerEvent::Opened(server_stream))
            .map_err(|_| unavailable("The server is not accepting streams"))?;
        Ok(Box::new(ChannelStream {
            id,
            events: self.events.clone(),
            closed,
        }))
    }
}

struct ChannelStream {
    id: u32,
    events: Sender<ServerEvent>,
    closed: Arc<AtomicBool>,
}

impl TransportStream for ChannelStream {
    fn send(&self, frame: Vec<u8>) -> FirestoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(internal_error("send on a closed stream"));
        }
        let frame = serde_json::from_slice(&frame)
            .map_err(|err| internal_error(format!("invalid frame: {err}")))?;
        self.events
            .try_send(ServerEvent::Message {
                stream_id: self.id,
                frame,
            })
            .map_err(|_| unavailable("The server went away"))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // The server may already be gone.
            let _ = self
                .events
                .try_send(ServerEvent::Closed { stream_id: self.id });
        }
    }
}

impl ChannelServer {
    /// Next event, or `None` once every connection handle is dropped.
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.events.recv().await.ok()
    }

    pub fn try_next_event(&self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }
}
