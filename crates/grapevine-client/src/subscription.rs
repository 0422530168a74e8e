// ABOUTME: Flow-controlled subscription over the bidirectional Subscribe stream.
// ABOUTME: A controller task owns the request/receive counters; handles observe via channels.

use futures::stream::StreamExt;
use futures::Stream;
use grapevine_codec::{decode_event, decode_replay_id, DecodedEvent};
use grapevine_proto::{ConsumerEvent, FetchRequest, FetchResponse, ReplayPreset};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, EventParseError};
use crate::schema::SchemaResolver;

/// How many event payloads are decoded concurrently within one batch.
///
/// Batches are capped by the broker at the requested count, so a small cap
/// keeps memory bounded without starving throughput.
pub const DEFAULT_DECODE_CONCURRENCY: usize = 8;

/// Buffer for notices between the controller task and the handle.
const NOTICE_BUFFER: usize = 256;

/// Where a subscription starts when it has no committed cursor yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayStart {
    /// Only events published after the subscription begins.
    #[default]
    Latest,
    /// Everything still retained by the broker.
    Earliest,
    /// Resume immediately after the given replay cursor.
    Custom(u64),
}

impl ReplayStart {
    pub(crate) fn to_wire(self) -> (ReplayPreset, Vec<u8>) {
        match self {
            ReplayStart::Latest => (ReplayPreset::Latest, Vec::new()),
            ReplayStart::Earliest => (ReplayPreset::Earliest, Vec::new()),
            ReplayStart::Custom(cursor) => {
                (ReplayPreset::Custom, grapevine_codec::encode_replay_id(cursor).to_vec())
            }
        }
    }
}

/// Lifecycle of the underlying gRPC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// The stream is open and may still deliver events.
    Streaming,
    /// The broker closed the stream cleanly.
    Ended,
    /// The stream died with a transport error.
    Failed,
}

/// Snapshot of a subscription's flow-control state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub topic_name: String,
    pub phase: StreamPhase,
    /// Total events requested from the broker so far.
    pub requested: u64,
    /// Total events received, counting both decoded and failed events.
    pub received: u64,
}

/// A failure scoped to the subscription, not the whole client.
#[derive(Debug)]
pub enum SubscriptionError {
    /// One event failed to decode. The stream continues.
    Parse(Box<EventParseError>),
    /// The stream itself failed. No further events will arrive.
    Transport(tonic::Status),
    /// The broker sent a batch the client could not interpret.
    Protocol(String),
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionError::Parse(e) => write!(f, "{e}"),
            SubscriptionError::Transport(status) => write!(f, "stream failed: {status}"),
            SubscriptionError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// Everything a subscription can hand to its consumer, in delivery order.
#[derive(Debug)]
pub enum SubscriptionNotice {
    /// A decoded event.
    Data(DecodedEvent),
    /// A scoped failure. Parse errors leave the stream running.
    Error(SubscriptionError),
    /// An empty batch carrying only a cursor commit. Does not count as
    /// a received event.
    Keepalive { latest_replay_id: u64 },
    /// Every requested event has now been received.
    LastEvent,
    /// Flow-control snapshot, emitted after each processed batch.
    Status(SubscriptionState),
    /// The broker closed the stream cleanly.
    End,
}

pub(crate) enum Command {
    RequestMore(i32),
}

/// Owns all mutable subscription state. Runs as a spawned task; the
/// [`Subscription`] handle talks to it exclusively through channels, so the
/// request/receive counters have a single writer.
struct Controller<S, R> {
    topic_name: String,
    inbound: S,
    resolver: R,
    requests: mpsc::Sender<FetchRequest>,
    commands: mpsc::Receiver<Command>,
    notices: mpsc::Sender<SubscriptionNotice>,
    state_tx: watch::Sender<SubscriptionState>,
    phase: StreamPhase,
    requested: u64,
    received: u64,
    last_event_sent: bool,
    decode_concurrency: usize,
}

impl<S, R> Controller<S, R>
where
    S: Stream<Item = Result<FetchResponse, tonic::Status>> + Unpin + Send + 'static,
    R: SchemaResolver + 'static,
{
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::RequestMore(count)) => {
                        if !self.request_more(count).await {
                            break;
                        }
                    }
                    // Handle dropped: nobody is listening anymore.
                    None => break,
                },
                message = self.inbound.next() => match message {
                    Some(Ok(response)) => {
                        if !self.handle_response(response).await {
                            break;
                        }
                    }
                    Some(Err(status)) => {
                        warn!(topic = %self.topic_name, %status, "subscription stream failed");
                        self.set_phase(StreamPhase::Failed);
                        let _ = self
                            .notices
                            .send(SubscriptionNotice::Error(SubscriptionError::Transport(status)))
                            .await;
                        break;
                    }
                    None => {
                        debug!(topic = %self.topic_name, "subscription stream ended");
                        self.set_phase(StreamPhase::Ended);
                        let _ = self.notices.send(SubscriptionNotice::End).await;
                        break;
                    }
                },
            }
        }
    }

    /// Process one batch. Returns false when the consumer went away.
    async fn handle_response(&mut self, response: FetchResponse) -> bool {
        let latest = match decode_replay_id(&response.latest_replay_id) {
            Ok(cursor) => cursor,
            Err(e) => {
                let notice = SubscriptionNotice::Error(SubscriptionError::Protocol(format!(
                    "bad latest replay cursor: {e}"
                )));
                return self.notices.send(notice).await.is_ok();
            }
        };

        if response.events.is_empty() {
            debug!(
                topic = %self.topic_name,
                latest_replay_id = latest,
                pending = response.pending_num_requested,
                "keepalive"
            );
            if self
                .notices
                .send(SubscriptionNotice::Keepalive { latest_replay_id: latest })
                .await
                .is_err()
            {
                return false;
            }
            return self
                .notices
                .send(SubscriptionNotice::Status(self.snapshot()))
                .await
                .is_ok();
        }

        let results: Vec<Result<DecodedEvent, EventParseError>> = futures::stream::iter(
            response
                .events
                .into_iter()
                .map(|raw| decode_one(&self.resolver, raw, latest)),
        )
        .buffered(self.decode_concurrency)
        .collect()
        .await;

        for result in results {
            self.received += 1;
            let notice = match result {
                Ok(event) => SubscriptionNotice::Data(event),
                Err(parse) => {
                    warn!(
                        topic = %self.topic_name,
                        replay_id = ?parse.replay_id,
                        error = %parse.cause,
                        "event failed to decode"
                    );
                    SubscriptionNotice::Error(SubscriptionError::Parse(Box::new(parse)))
                }
            };
            if self.notices.send(notice).await.is_err() {
                return false;
            }
        }

        if self.received >= self.requested && !self.last_event_sent {
            self.last_event_sent = true;
            if self.notices.send(SubscriptionNotice::LastEvent).await.is_err() {
                return false;
            }
        }

        self.publish_state();
        self.notices
            .send(SubscriptionNotice::Status(self.snapshot()))
            .await
            .is_ok()
    }

    /// Ask the broker for `count` more events. Returns false when the
    /// outbound request stream is gone.
    async fn request_more(&mut self, count: i32) -> bool {
        if count <= 0 {
            return true;
        }
        self.requested += count as u64;
        self.last_event_sent = false;
        self.publish_state();
        let request = FetchRequest {
            topic_name: self.topic_name.clone(),
            num_requested: count,
            ..Default::default()
        };
        debug!(topic = %self.topic_name, count, total = self.requested, "requesting more events");
        self.requests.send(request).await.is_ok()
    }

    fn snapshot(&self) -> SubscriptionState {
        SubscriptionState {
            topic_name: self.topic_name.clone(),
            phase: self.phase,
            requested: self.requested,
            received: self.received,
        }
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send(self.snapshot());
    }

    fn set_phase(&mut self, phase: StreamPhase) {
        self.phase = phase;
        self.publish_state();
    }
}

/// Decode one raw event. Parse failures carry the raw event and cursor
/// context so the consumer can resume past the bad event.
async fn decode_one<R: SchemaResolver>(
    resolver: &R,
    raw: ConsumerEvent,
    latest_replay_id: u64,
) -> Result<DecodedEvent, EventParseError> {
    let replay_id = decode_replay_id(&raw.replay_id).ok();

    let fail = |cause: ClientError, raw: ConsumerEvent| EventParseError {
        replay_id,
        latest_replay_id,
        raw_event: raw,
        cause: Box::new(cause),
    };

    let Some(event) = raw.event.as_ref() else {
        return Err(fail(
            ClientError::MalformedEvent("missing event body".to_string()),
            raw.clone(),
        ));
    };

    let schema = match resolver.schema_by_id(&event.schema_id).await {
        Ok(schema) => schema,
        Err(e) => return Err(fail(e, raw.clone())),
    };

    match decode_event(&schema.codec, &raw.replay_id, &event.payload) {
        Ok(decoded) => Ok(decoded),
        Err(e) => Err(fail(ClientError::Codec(e), raw.clone())),
    }
}

/// Consumer handle for an active subscription.
///
/// Dropping the handle aborts the controller task and tears the stream down.
pub struct Subscription {
    notices: mpsc::Receiver<SubscriptionNotice>,
    state: watch::Receiver<SubscriptionState>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Next notice, in delivery order. `None` after the controller exits and
    /// the buffer drains.
    pub async fn next(&mut self) -> Option<SubscriptionNotice> {
        self.notices.recv().await
    }

    /// Current flow-control snapshot.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Ask the broker for `additional` more events on this subscription.
    pub async fn request_more(&self, additional: i32) -> Result<(), ClientError> {
        self.commands
            .send(Command::RequestMore(additional))
            .await
            .map_err(|_| ClientError::StreamClosed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the controller task for an established stream and return its handle.
pub(crate) fn spawn<S, R>(
    topic_name: String,
    inbound: S,
    resolver: R,
    requests: mpsc::Sender<FetchRequest>,
    initial_requested: i32,
    decode_concurrency: usize,
) -> Subscription
where
    S: Stream<Item = Result<FetchResponse, tonic::Status>> + Unpin + Send + 'static,
    R: SchemaResolver + 'static,
{
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_BUFFER);
    let (command_tx, command_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(SubscriptionState {
        topic_name: topic_name.clone(),
        phase: StreamPhase::Streaming,
        requested: initial_requested.max(0) as u64,
        received: 0,
    });

    let controller = Controller {
        topic_name,
        inbound,
        resolver,
        requests,
        commands: command_rx,
        notices: notice_tx,
        state_tx,
        phase: StreamPhase::Streaming,
        requested: initial_requested.max(0) as u64,
        received: 0,
        last_event_sent: false,
        decode_concurrency,
    };

    let task = tokio::spawn(controller.run());

    Subscription {
        notices: notice_rx,
        state: state_rx,
        commands: command_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BusSchema, SchemaResolver};
    use async_trait::async_trait;
    use grapevine_codec::{encode_replay_id, EventCodec};
    use grapevine_proto::ProducerEvent;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_stream::wrappers::ReceiverStream;

    const TEST_SCHEMA: &str = r#"{
        "type": "record",
        "name": "OrderEvent",
        "fields": [
            {"name": "OrderNumber", "type": "string"},
            {"name": "Amount", "type": "long"}
        ]
    }"#;

    struct FixedResolver {
        schema: Arc<BusSchema>,
    }

    impl FixedResolver {
        fn new() -> Self {
            Self {
                schema: Arc::new(BusSchema {
                    id: "schema-1".to_string(),
                    codec: EventCodec::parse(TEST_SCHEMA).unwrap(),
                }),
            }
        }
    }

    #[async_trait]
    impl SchemaResolver for FixedResolver {
        async fn schema_by_id(&self, schema_id: &str) -> Result<Arc<BusSchema>, ClientError> {
            if schema_id == "schema-1" {
                Ok(self.schema.clone())
            } else {
                Err(ClientError::SchemaFetch {
                    key: schema_id.to_string(),
                    message: "unknown schema".to_string(),
                })
            }
        }
    }

    fn make_event(replay_id: u64, order_number: &str) -> ConsumerEvent {
        let codec = EventCodec::parse(TEST_SCHEMA).unwrap();
        let payload = codec
            .encode(&json!({"OrderNumber": order_number, "Amount": 100}))
            .unwrap();
        ConsumerEvent {
            event: Some(ProducerEvent {
                id: format!("evt-{replay_id}"),
                schema_id: "schema-1".to_string(),
                payload,
                headers: vec![],
            }),
            replay_id: encode_replay_id(replay_id).to_vec(),
        }
    }

    fn start(
        initial_requested: i32,
    ) -> (
        mpsc::Sender<Result<FetchResponse, tonic::Status>>,
        mpsc::Receiver<FetchRequest>,
        Subscription,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (request_tx, request_rx) = mpsc::channel(16);
        let subscription = spawn(
            "/event/Order__e".to_string(),
            ReceiverStream::new(inbound_rx),
            FixedResolver::new(),
            request_tx,
            initial_requested,
            DEFAULT_DECODE_CONCURRENCY,
        );
        (inbound_tx, request_rx, subscription)
    }

    #[tokio::test]
    async fn test_empty_batch_is_keepalive() {
        let (inbound, _requests, mut sub) = start(5);
        inbound
            .send(Ok(FetchResponse {
                latest_replay_id: encode_replay_id(7).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionNotice::Keepalive { latest_replay_id } => {
                assert_eq!(latest_replay_id, 7)
            }
            other => panic!("expected keepalive, got {other:?}"),
        }
        // A status snapshot follows every processed batch, keepalives included,
        // and keepalives never count toward received.
        match sub.next().await.unwrap() {
            SubscriptionNotice::Status(state) => {
                assert_eq!(state.received, 0);
                assert_eq!(state.requested, 5);
            }
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(sub.state().received, 0);
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_then_last_event() {
        let (inbound, _requests, mut sub) = start(2);
        inbound
            .send(Ok(FetchResponse {
                events: vec![make_event(10, "A"), make_event(11, "B")],
                latest_replay_id: encode_replay_id(11).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionNotice::Data(event) => {
                assert_eq!(event.replay_id, 10);
                assert_eq!(event.payload["OrderNumber"], "A");
            }
            other => panic!("expected data, got {other:?}"),
        }
        match sub.next().await.unwrap() {
            SubscriptionNotice::Data(event) => assert_eq!(event.replay_id, 11),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(
            sub.next().await.unwrap(),
            SubscriptionNotice::LastEvent
        ));
        match sub.next().await.unwrap() {
            SubscriptionNotice::Status(state) => {
                assert_eq!(state.requested, 2);
                assert_eq!(state.received, 2);
                assert_eq!(state.phase, StreamPhase::Streaming);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_event_does_not_kill_stream() {
        let (inbound, _requests, mut sub) = start(3);

        let mut bad = make_event(21, "B");
        bad.event.as_mut().unwrap().payload = vec![0xFF, 0xFF, 0xFF];

        inbound
            .send(Ok(FetchResponse {
                events: vec![make_event(20, "A"), bad, make_event(22, "C")],
                latest_replay_id: encode_replay_id(22).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();

        assert!(matches!(
            sub.next().await.unwrap(),
            SubscriptionNotice::Data(_)
        ));
        match sub.next().await.unwrap() {
            SubscriptionNotice::Error(SubscriptionError::Parse(parse)) => {
                assert_eq!(parse.replay_id, Some(21));
                assert_eq!(parse.latest_replay_id, 22);
                assert!(parse.raw_event.event.is_some());
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        // The stream survives and delivers the event after the bad one.
        match sub.next().await.unwrap() {
            SubscriptionNotice::Data(event) => assert_eq!(event.replay_id, 22),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(
            sub.next().await.unwrap(),
            SubscriptionNotice::LastEvent
        ));
        // Failed events still count toward received.
        match sub.next().await.unwrap() {
            SubscriptionNotice::Status(state) => assert_eq!(state.received, 3),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_schema_is_parse_error() {
        let (inbound, _requests, mut sub) = start(1);

        let mut event = make_event(30, "A");
        event.event.as_mut().unwrap().schema_id = "schema-404".to_string();

        inbound
            .send(Ok(FetchResponse {
                events: vec![event],
                latest_replay_id: encode_replay_id(30).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionNotice::Error(SubscriptionError::Parse(parse)) => {
                assert!(matches!(*parse.cause, ClientError::SchemaFetch { .. }));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_event_emitted_once_on_over_delivery() {
        let (inbound, _requests, mut sub) = start(1);
        inbound
            .send(Ok(FetchResponse {
                events: vec![make_event(1, "A"), make_event(2, "B")],
                latest_replay_id: encode_replay_id(2).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();
        inbound
            .send(Ok(FetchResponse {
                events: vec![make_event(3, "C")],
                latest_replay_id: encode_replay_id(3).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();
        drop(inbound);

        let mut last_events = 0;
        let mut data = 0;
        while let Some(notice) = sub.next().await {
            match notice {
                SubscriptionNotice::LastEvent => last_events += 1,
                SubscriptionNotice::Data(_) => data += 1,
                _ => {}
            }
        }
        assert_eq!(data, 3);
        assert_eq!(last_events, 1);
    }

    #[tokio::test]
    async fn test_transport_error_fails_stream() {
        let (inbound, _requests, mut sub) = start(1);
        inbound
            .send(Err(tonic::Status::unavailable("broker gone")))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionNotice::Error(SubscriptionError::Transport(status)) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(sub.next().await.is_none());
        assert_eq!(sub.state().phase, StreamPhase::Failed);
    }

    #[tokio::test]
    async fn test_clean_end() {
        let (inbound, _requests, mut sub) = start(1);
        drop(inbound);

        assert!(matches!(sub.next().await.unwrap(), SubscriptionNotice::End));
        assert!(sub.next().await.is_none());
        assert_eq!(sub.state().phase, StreamPhase::Ended);
    }

    #[tokio::test]
    async fn test_request_more_sends_fetch_request() {
        let (inbound, mut requests, mut sub) = start(2);

        sub.request_more(5).await.unwrap();
        let request = requests.recv().await.unwrap();
        assert_eq!(request.topic_name, "/event/Order__e");
        assert_eq!(request.num_requested, 5);
        // Later fetch requests carry no replay cursor.
        assert!(request.replay_id.is_empty());
        assert_eq!(sub.state().requested, 7);

        // After topping up, delivery of all 7 yields a fresh LastEvent.
        inbound
            .send(Ok(FetchResponse {
                events: (0..7).map(|i| make_event(i, "X")).collect(),
                latest_replay_id: encode_replay_id(6).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();
        let mut saw_last_event = false;
        for _ in 0..9 {
            if matches!(sub.next().await.unwrap(), SubscriptionNotice::LastEvent) {
                saw_last_event = true;
                break;
            }
        }
        assert!(saw_last_event);
    }

    #[tokio::test]
    async fn test_bad_latest_cursor_is_protocol_error() {
        let (inbound, _requests, mut sub) = start(1);
        inbound
            .send(Ok(FetchResponse {
                latest_replay_id: vec![1, 2, 3],
                ..Default::default()
            }))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            SubscriptionNotice::Error(SubscriptionError::Protocol(msg)) => {
                assert!(msg.contains("replay cursor"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        // The stream is still alive afterwards.
        inbound
            .send(Ok(FetchResponse {
                latest_replay_id: encode_replay_id(1).to_vec(),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(matches!(
            sub.next().await.unwrap(),
            SubscriptionNotice::Keepalive { .. }
        ));
    }

    #[test]
    fn test_replay_start_wire_encoding() {
        assert_eq!(ReplayStart::Latest.to_wire(), (ReplayPreset::Latest, vec![]));
        assert_eq!(
            ReplayStart::Earliest.to_wire(),
            (ReplayPreset::Earliest, vec![])
        );
        let (preset, cursor) = ReplayStart::Custom(42).to_wire();
        assert_eq!(preset, ReplayPreset::Custom);
        assert_eq!(cursor, vec![0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn test_replay_start_default_is_latest() {
        assert_eq!(ReplayStart::default(), ReplayStart::Latest);
    }
}
