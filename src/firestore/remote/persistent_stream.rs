//! Lifecycle shared by the watch and write streams.
//!
//! A stream moves `Initial -> Starting -> Open`. Any failure closes it into
//! `Error`; the next start then waits out a backoff delay first. Every start
//! and close bumps a generation counter, and callbacks carrying an older
//! generation are dropped, so late events of a superseded transport never
//! reach the remote store.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::core::TargetId;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{Mutation, SnapshotVersion};
use crate::firestore::remote::connection::{
    Connection, StreamKind, StreamListener, TransportStream,
};
use crate::firestore::remote::credentials::{AuthToken, CredentialsProvider};
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::{BackoffSettings, ExponentialBackoff};

const LOG_TARGET: &str = "firestore::persistent_stream";

/// Something that happened to a transport stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Open,
    Message(Vec<u8>),
    Close(Option<FirestoreError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTimer {
    StreamIdle { kind: StreamKind, generation: u64 },
    StreamBackoff { kind: StreamKind, generation: u64 },
    OnlineStateTimeout,
}

/// Work for the remote store that arrives from outside the serial queue.
#[derive(Debug)]
pub enum RemoteInput {
    Stream {
        kind: StreamKind,
        generation: u64,
        event: StreamEvent,
    },
    Token {
        kind: StreamKind,
        generation: u64,
        result: FirestoreResult<Option<AuthToken>>,
    },
    Timer(RemoteTimer),
}

/// Routes [`RemoteInput`]s back onto the queue that owns the remote store.
pub trait RemoteScheduler: Send + Sync {
    fn deliver(&self, input: RemoteInput);

    fn deliver_after(&self, timer_id: TimerId, delay: Duration, input: RemoteInput)
        -> DelayedOperation;

    /// Delivers the input the future resolves to.
    fn deliver_when_ready(&self, input: BoxFuture<'static, RemoteInput>);
}

/// State that consumes [`RemoteInput`]s.
pub trait RemoteInputHandler {
    fn handle_remote_input(&mut self, input: RemoteInput);
}

impl<S> RemoteScheduler for AsyncQueue<S>
where
    S: RemoteInputHandler + Send + 'static,
{
    fn deliver(&self, input: RemoteInput) {
        self.enqueue_and_forget(move |state: &mut S| state.handle_remote_input(input));
    }

    fn deliver_after(
        &self,
        timer_id: TimerId,
        delay: Duration,
        input: RemoteInput,
    ) -> DelayedOperation {
        self.enqueue_after_delay(timer_id, delay, move |state: &mut S| {
            state.handle_remote_input(input)
        })
    }

    fn deliver_when_ready(&self, input: BoxFuture<'static, RemoteInput>) {
        self.spawn_and_enqueue(input, |state: &mut S, input| {
            state.handle_remote_input(input)
        });
    }
}

/// Forwards transport callbacks, tagged with the generation they belong to.
struct QueuedStreamListener {
    kind: StreamKind,
    generation: u64,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl QueuedStreamListener {
    fn forward(&self, event: StreamEvent) {
        self.scheduler.deliver(RemoteInput::Stream {
            kind: self.kind,
            generation: self.generation,
            event,
        });
    }
}

impl StreamListener for QueuedStreamListener {
    fn on_open(&self) {
        self.forward(StreamEvent::Open);
    }

    fn on_message(&self, frame: Vec<u8>) {
        self.forward(StreamEvent::Message(frame));
    }

    fn on_close(&self, error: Option<FirestoreError>) {
        self.forward(StreamEvent::Close(error));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Waiting for a token or for the transport to open.
    Starting,
    Open,
    /// Closed by a failure; the next start backs off.
    Error,
    /// Waiting for the backoff timer.
    Backoff,
}

/// What the owner of a stream has to react to.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    Opened,
    Message(Vec<u8>),
    Closed(Option<FirestoreError>),
}

pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    stream: Option<Box<dyn TransportStream>>,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    scheduler: Arc<dyn RemoteScheduler>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        scheduler: Arc<dyn RemoteScheduler>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            stream: None,
            backoff: ExponentialBackoff::new(backoff),
            idle_timeout,
            idle_timer: None,
            backoff_timer: None,
            connection,
            credentials,
            scheduler,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starting, backing off, or open.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Backoff | StreamState::Open
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Fetches a token and opens the transport. After a failure the attempt
    /// is delayed by the backoff.
    pub fn start(&mut self) {
        if self.state == StreamState::Error {
            self.perform_backoff();
            return;
        }
        if self.state != StreamState::Initial {
            log::debug!(target: LOG_TARGET, "{} stream already started", self.kind.as_str());
            return;
        }

        self.state = StreamState::Starting;
        self.generation += 1;
        let kind = self.kind;
        let generation = self.generation;
        let credentials = Arc::clone(&self.credentials);
        self.scheduler.deliver_when_ready(Box::pin(async move {
            let result = credentials.get_token().await;
            RemoteInput::Token {
                kind,
                generation,
                result,
            }
        }));
    }

    /// Closes the stream on purpose. Returns the close signal if the stream
    /// was started.
    pub fn stop(&mut self) -> Option<StreamSignal> {
        if self.is_started() {
            Some(self.close(StreamState::Initial, None))
        } else {
            None
        }
    }

    /// Lets the next start skip the backoff delay, e.g. after a permanent
    /// write error that the client already handled.
    pub fn inhibit_backoff(&mut self) {
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Schedules closing the stream unless it is used again in the meantime.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            let timer_id = match self.kind {
                StreamKind::Watch => TimerId::ListenStreamIdle,
                StreamKind::Write => TimerId::WriteStreamIdle,
            };
            let input = RemoteInput::Timer(RemoteTimer::StreamIdle {
                kind: self.kind,
                generation: self.generation,
            });
            self.idle_timer = Some(
                self.scheduler
                    .deliver_after(timer_id, self.idle_timeout, input),
            );
        }
    }

    pub fn send(&mut self, frame: Vec<u8>) -> FirestoreResult<()> {
        self.cancel_idle_timer();
        match &self.stream {
            Some(stream) => stream.send(frame),
            None => Err(internal_error(format!(
                "{} stream is not open",
                self.kind.as_str()
            ))),
        }
    }

    pub fn handle_token(
        &mut self,
        generation: u64,
        result: FirestoreResult<Option<AuthToken>>,
    ) -> Option<StreamSignal> {
        if generation != self.generation || self.state != StreamState::Starting {
            log::debug!(
                target: LOG_TARGET,
                "ignoring token for superseded {} stream",
                self.kind.as_str()
            );
            return None;
        }
        let token = match result {
            Ok(token) => token,
            Err(err) => return Some(self.close(StreamState::Error, Some(err))),
        };
        let listener = Arc::new(QueuedStreamListener {
            kind: self.kind,
            generation,
            scheduler: Arc::clone(&self.scheduler),
        });
        match self.connection.open_stream(self.kind, token, listener) {
            Ok(stream) => {
                self.stream = Some(stream);
                None
            }
            Err(err) => Some(self.close(StreamState::Error, Some(err))),
        }
    }

    pub fn handle_event(&mut self, generation: u64, event: StreamEvent) -> Option<StreamSignal> {
        if generation != self.generation {
            log::debug!(
                target: LOG_TARGET,
                "ignoring event of superseded {} stream",
                self.kind.as_str()
            );
            return None;
        }
        match event {
            StreamEvent::Open => {
                log::debug!(target: LOG_TARGET, "{} stream open", self.kind.as_str());
                self.state = StreamState::Open;
                Some(StreamSignal::Opened)
            }
            StreamEvent::Message(frame) => Some(StreamSignal::Message(frame)),
            StreamEvent::Close(error) => Some(self.close(StreamState::Error, error)),
        }
    }

    pub fn handle_idle_timeout(&mut self, generation: u64) -> Option<StreamSignal> {
        self.idle_timer = None;
        if generation == self.generation && self.is_open() {
            log::debug!(target: LOG_TARGET, "closing idle {} stream", self.kind.as_str());
            Some(self.close(StreamState::Initial, None))
        } else {
            None
        }
    }

    pub fn handle_backoff_elapsed(&mut self, generation: u64) {
        self.backoff_timer = None;
        if generation == self.generation && self.state == StreamState::Backoff {
            self.state = StreamState::Initial;
            self.start();
        }
    }

    /// Tears the stream down and moves it to `final_state`.
    pub fn close(
        &mut self,
        final_state: StreamState,
        error: Option<FirestoreError>,
    ) -> StreamSignal {
        self.cancel_idle_timer();
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }

        match error.as_ref().map(|err| err.code) {
            Some(FirestoreErrorCode::ResourceExhausted) => {
                log::error!(
                    target: LOG_TARGET,
                    "{} stream exhausted a resource, backing off for the maximum delay",
                    self.kind.as_str()
                );
                self.backoff.reset_to_max();
            }
            Some(FirestoreErrorCode::Unauthenticated) => self.credentials.invalidate_token(),
            _ => {}
        }
        if final_state != StreamState::Error {
            self.backoff.reset();
        }

        self.generation += 1;
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        log::debug!(
            target: LOG_TARGET,
            "{} stream closed: {}",
            self.kind.as_str(),
            error
                .as_ref()
                .map_or_else(|| "no error".to_string(), ToString::to_string)
        );
        self.state = final_state;
        StreamSignal::Closed(error)
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        let timer_id = match self.kind {
            StreamKind::Watch => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        let input = RemoteInput::Timer(RemoteTimer::StreamBackoff {
            kind: self.kind,
            generation: self.generation,
        });
        log::debug!(
            target: LOG_TARGET,
            "backing off {} stream for {delay:?}",
            self.kind.as_str()
        );
        self.backoff_timer = Some(self.scheduler.deliver_after(timer_id, delay, input));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}

fn encode_frame(value: &serde_json::Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

fn parse_frame(frame: &[u8]) -> FirestoreResult<serde_json::Value> {
    serde_json::from_slice(frame)
        .map_err(|err| internal_error(format!("Malformed stream frame: {err}")))
}

/// Watch stream: adds and removes targets and decodes listen responses.
pub struct WatchStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(stream: PersistentStream, serializer: JsonProtoSerializer) -> Self {
        Self { stream, serializer }
    }

    pub fn watch(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.serializer.encode_listen_request(target_data);
        self.stream.send(encode_frame(&request))
    }

    pub fn unwatch(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let request = self.serializer.encode_unlisten_request(target_id);
        self.stream.send(encode_frame(&request))
    }

    /// Decodes a listen response into the change it carries and the global
    /// snapshot version it completes, `min` if none.
    pub fn decode(&mut self, frame: &[u8]) -> FirestoreResult<(WatchChange, SnapshotVersion)> {
        let message = parse_frame(frame)?;
        let change = decode_watch_change(&self.serializer, &message)?;
        let version = self.serializer.version_from_listen_response(&message)?;
        // A decodable message proves the connection is healthy.
        self.stream.reset_backoff();
        Ok((change, version))
    }
}

impl Deref for WatchStream {
    type Target = PersistentStream;

    fn deref(&self) -> &PersistentStream {
        &self.stream
    }
}

impl DerefMut for WatchStream {
    fn deref_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStreamResponse {
    HandshakeComplete,
    MutationResults(WriteResponse),
}

/// Write stream: performs the handshake, then sends mutation batches and
/// decodes their results.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(stream: PersistentStream, serializer: JsonProtoSerializer) -> Self {
        Self {
            stream,
            serializer,
            handshake_complete: false,
            last_stream_token: Vec::new(),
        }
    }

    /// Starts the stream; a new stream always begins with a handshake.
    pub fn start(&mut self) {
        self.handshake_complete = false;
        self.stream.start();
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }

    /// Sends the first request on a freshly opened stream.
    pub fn write_handshake(&mut self) -> FirestoreResult<()> {
        self.handshake_complete = false;
        let request = self.serializer.encode_write_handshake(&self.last_stream_token);
        self.stream.send(encode_frame(&request))
    }

    pub fn write_mutations(&mut self, mutations: &[Mutation]) -> FirestoreResult<()> {
        if !self.handshake_complete {
            return Err(internal_error("Handshake must complete before writing mutations"));
        }
        let request = self
            .serializer
            .encode_write_request(&self.last_stream_token, mutations);
        self.stream.send(encode_frame(&request))
    }

    pub fn decode(&mut self, frame: &[u8]) -> FirestoreResult<WriteStreamResponse> {
        let message = parse_frame(frame)?;
        let response = self.serializer.decode_write_response(&message)?;
        self.last_stream_token = response.stream_token.clone();
        if !self.handshake_complete {
            self.handshake_complete = true;
            return Ok(WriteStreamResponse::HandshakeComplete);
        }
        self.stream.reset_backoff();
        Ok(WriteStreamResponse::MutationResults(response))
    }
}

impl Deref for WriteStream {
    type Target = PersistentStream;

    fn deref(&self) -> &PersistentStream {
        &self.stream
    }
}

impl DerefMut for WriteStream {
    fn deref_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated, unavailable};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::connection::MockConnection;
    use crate::firestore::remote::credentials::{StaticCredentialsProvider, User};
    use crate::firestore::util::ManualDriver;
    use serde_json::json;

    struct Harness {
        stream: PersistentStream,
        signals: Vec<StreamSignal>,
    }

    impl RemoteInputHandler for Harness {
        fn handle_remote_input(&mut self, input: RemoteInput) {
            let signal = match input {
                RemoteInput::Token {
                    generation, result, ..
                } => self.stream.handle_token(generation, result),
                RemoteInput::Stream {
                    generation, event, ..
                } => self.stream.handle_event(generation, event),
                RemoteInput::Timer(RemoteTimer::StreamIdle { generation, .. }) => {
                    self.stream.handle_idle_timeout(generation)
                }
                RemoteInput::Timer(RemoteTimer::StreamBackoff { generation, .. }) => {
                    self.stream.handle_backoff_elapsed(generation);
                    None
                }
                RemoteInput::Timer(RemoteTimer::OnlineStateTimeout) => None,
            };
            self.signals.extend(signal);
        }
    }

    fn harness(
        credentials: Arc<dyn CredentialsProvider>,
    ) -> (Harness, ManualDriver<Harness>, MockConnection) {
        let (queue, driver) = AsyncQueue::manual(BackoffSettings::default());
        let connection = MockConnection::new();
        let stream = PersistentStream::new(
            StreamKind::Watch,
            Arc::new(connection.clone()),
            credentials,
            Arc::new(queue),
            BackoffSettings::default(),
            Duration::from_secs(60),
        );
        let harness = Harness {
            stream,
            signals: Vec::new(),
        };
        (harness, driver, connection)
    }

    fn provider() -> StaticCredentialsProvider {
        StaticCredentialsProvider::new(User::new("alice"), Some("token".into()))
    }

    #[test]
    fn opens_with_a_token() {
        let (mut harness, driver, connection) = harness(Arc::new(provider()));
        harness.stream.start();
        driver.run_pending(&mut harness);
        assert_eq!(harness.stream.state(), StreamState::Starting);

        let server = connection.last_stream(StreamKind::Watch).unwrap();
        assert_eq!(server.token().unwrap().value, "token");
        server.open();
        driver.run_pending(&mut harness);
        assert!(harness.stream.is_open());
        assert!(matches!(harness.signals.as_slice(), [StreamSignal::Opened]));
    }

    #[test]
    fn events_of_superseded_streams_are_dropped() {
        let (mut harness, driver, connection) = harness(Arc::new(provider()));
        harness.stream.start();
        driver.run_pending(&mut harness);
        let old = connection.last_stream(StreamKind::Watch).unwrap();
        harness.stream.stop();
        assert!(old.is_closed());

        old.respond(json!({"late": true}));
        driver.run_pending(&mut harness);
        assert!(harness.signals.is_empty());
    }

    #[test]
    fn failures_back_off_before_reconnecting() {
        let (mut harness, driver, connection) = harness(Arc::new(provider()));
        harness.stream.start();
        driver.run_pending(&mut harness);
        connection
            .last_stream(StreamKind::Watch)
            .unwrap()
            .fail(Some(unavailable("down")));
        driver.run_pending(&mut harness);
        assert_eq!(harness.stream.state(), StreamState::Error);

        harness.stream.start();
        assert_eq!(harness.stream.state(), StreamState::Backoff);
        assert!(driver.has_delayed(TimerId::ListenStreamConnectionBackoff));
        driver.run_delayed(&mut harness, TimerId::ListenStreamConnectionBackoff);
        assert_eq!(harness.stream.state(), StreamState::Starting);
        assert_eq!(connection.open_count(StreamKind::Watch), 2);
    }

    #[test]
    fn unauthenticated_close_invalidates_the_token() {
        let credentials = provider();
        let (mut harness, driver, connection) = harness(Arc::new(credentials.clone()));
        harness.stream.start();
        driver.run_pending(&mut harness);
        connection
            .last_stream(StreamKind::Watch)
            .unwrap()
            .fail(Some(unauthenticated("expired")));
        driver.run_pending(&mut harness);
        assert_eq!(credentials.invalidation_count(), 1);
    }

    #[test]
    fn resource_exhausted_backs_off_for_the_maximum() {
        let (mut harness, _driver, _connection) = harness(Arc::new(provider()));
        harness.stream.state = StreamState::Open;
        harness
            .stream
            .close(StreamState::Error, Some(resource_exhausted("quota")));
        assert_eq!(
            harness.stream.backoff.current_base(),
            BackoffSettings::default().max_delay
        );
    }

    #[test]
    fn idle_streams_close_after_the_timeout() {
        let (mut harness, driver, connection) = harness(Arc::new(provider()));
        harness.stream.start();
        driver.run_pending(&mut harness);
        connection.last_stream(StreamKind::Watch).unwrap().open();
        driver.run_pending(&mut harness);

        harness.stream.mark_idle();
        driver.run_delayed(&mut harness, TimerId::ListenStreamIdle);
        assert_eq!(harness.stream.state(), StreamState::Initial);
        assert!(matches!(
            harness.signals.last(),
            Some(StreamSignal::Closed(None))
        ));
    }

    #[test]
    fn write_stream_handshake_precedes_writes() {
        let (queue, _driver) = AsyncQueue::<Harness>::manual(BackoffSettings::default());
        let connection = MockConnection::new();
        let stream = PersistentStream::new(
            StreamKind::Write,
            Arc::new(connection),
            Arc::new(provider()),
            Arc::new(queue),
            BackoffSettings::default(),
            Duration::from_secs(60),
        );
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let mut write = WriteStream::new(stream, serializer);
        assert!(write.write_mutations(&[]).is_err());

        let response = write
            .decode(json!({"streamToken": "AQI="}).to_string().as_bytes())
            .unwrap();
        assert_eq!(response, WriteStreamResponse::HandshakeComplete);
        assert_eq!(write.last_stream_token(), &[1, 2]);
        assert!(write.handshake_complete());
    }
}
