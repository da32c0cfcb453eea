use super::connection::Direction;
use super::NodeId;
use crate::document::Value;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The default time a request waits for its response before it expires.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Reserved message kinds. Unknown kinds pass through the engine untouched
/// and are delivered to the registered handlers.
pub mod kind {
    pub const JOIN_REQUEST: &str = "JoinRequest";
    pub const JOIN_RESULT: &str = "JoinResult";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const INITIATE_LEADER_VOTE: &str = "InitiateLeaderVote";
    pub const LEADER_VOTE_RESPONSE: &str = "LeaderVoteResponse";
    pub const NEW_LEADER: &str = "NewLeader";
    pub const LEADER_REQUEST: &str = "LeaderRequest";
    pub const LEADER_RESPONSE: &str = "LeaderResponse";
    pub const CHORD_SUCCESSOR_REQUEST: &str = "ChordSuccessorRequest";
    pub const CHORD_SUCCESSOR_RESPONSE: &str = "ChordSuccessorResponse";
    pub const CHORD_PREDECESSOR_REQUEST: &str = "ChordPredecessorRequest";
    pub const CHORD_PREDECESSOR_RESPONSE: &str = "ChordPredecessorResponse";
    pub const CHORD_NOTIFY: &str = "ChordNotify";
}

/// A message passed between peers. The record itself is immutable; per-send
/// runtime state (status, response, expiry) lives in the Delivery handle
/// returned by Network::send.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Unique per sender, assigned monotonically at send time. Zero is
    /// never assigned, so it can mark "no response correlation" below.
    pub id: u32,
    /// The id of the request this message responds to, or zero.
    pub in_response_to: u32,
    /// Whether the sender expects a response.
    pub waiting_for_response: bool,
    /// The message type tag, e.g. "JoinRequest".
    pub kind: String,
    /// The payload document.
    pub payload: Value,
    /// The peer to send to, or the peer it came from.
    pub address: NodeId,
    /// Which registry holds the connection this message travels on.
    pub direction: Direction,
}

impl Message {
    /// Creates a request expecting a response, over an outgoing connection.
    pub fn request(address: NodeId, kind: &str, payload: Value) -> Self {
        Self {
            id: 0,
            in_response_to: 0,
            waiting_for_response: true,
            kind: kind.to_owned(),
            payload,
            address,
            direction: Direction::Outgoing,
        }
    }

    /// Creates a one-way message over an outgoing connection.
    pub fn event(address: NodeId, kind: &str, payload: Value) -> Self {
        Self { waiting_for_response: false, ..Self::request(address, kind, payload) }
    }

    /// Creates a response to a received request. The response travels back
    /// over the connection the request arrived on.
    pub fn respond(request: &Message, kind: &str, payload: Value) -> Self {
        Self {
            id: 0,
            in_response_to: request.id,
            waiting_for_response: false,
            kind: kind.to_owned(),
            payload,
            address: request.address.clone(),
            direction: request.direction,
        }
    }

    /// Returns the same message addressed over the given registry direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// The lifecycle of a sent message.
///
/// Created → Sending → (Sent | SendingFailure), and when waiting for a
/// response Sent → WaitingForResponse → (ResponseReceived | ResponseFailure
/// | ResponseTimeout). A send succeeded iff the final status is Sent or
/// ResponseReceived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Created,
    Sending,
    Sent,
    SendingFailure,
    WaitingForResponse,
    ResponseReceived,
    ResponseFailure,
    ResponseTimeout,
}

impl MessageStatus {
    /// Whether the message is still in flight.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Created | Self::Sending | Self::WaitingForResponse)
    }

    /// Whether the message reached a successful final status.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Sent | Self::ResponseReceived)
    }
}

/// A callback invoked with the response to a request, exactly once, on a
/// worker thread.
pub type ResponseCallback = Box<dyn FnOnce(&Message) + Send + 'static>;

/// Per-send options.
pub struct SendOptions {
    /// How long to wait for a response before the message expires.
    pub timeout: Duration,
    /// Whether the message may only travel established connections. Only
    /// the join handshake itself travels connections still identifying.
    pub require_established: bool,
    /// Callback invoked with the response, if one arrives.
    pub on_response: Option<ResponseCallback>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT, require_established: true, on_response: None }
    }
}

impl SendOptions {
    /// Options with a custom response timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self { timeout, ..Self::default() }
    }
}

/// Tracks a sent message: its status, its response once received, and the
/// response callback. Shared between the sender, the send workers, the
/// receive loop, and the maintenance loop.
pub struct Delivery {
    message: Message,
    status: Mutex<MessageStatus>,
    response: Mutex<Option<Message>>,
    on_response: Mutex<Option<ResponseCallback>>,
    require_established: bool,
    expires_at: Instant,
}

impl Delivery {
    /// Creates a new delivery for a message about to be sent.
    pub(super) fn new(message: Message, options: SendOptions) -> Self {
        Self {
            message,
            status: Mutex::new(MessageStatus::Created),
            response: Mutex::new(None),
            on_response: Mutex::new(options.on_response),
            require_established: options.require_established,
            expires_at: Instant::now() + options.timeout,
        }
    }

    /// The message being delivered.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The current status.
    pub fn status(&self) -> MessageStatus {
        *self.status.lock().expect("lock poisoned")
    }

    /// Whether the delivery reached a successful final status.
    pub fn succeeded(&self) -> bool {
        self.status().is_success()
    }

    /// The response, if one was received.
    pub fn response(&self) -> Option<Message> {
        self.response.lock().expect("lock poisoned").clone()
    }

    /// When the delivery expires.
    pub(super) fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the message may travel a connection still identifying.
    pub(super) fn require_established(&self) -> bool {
        self.require_established
    }

    /// Transitions the status. Terminal statuses are absorbing: a late
    /// failure cannot overwrite a received response or vice versa.
    pub(super) fn set_status(&self, status: MessageStatus) {
        let mut current = self.status.lock().expect("lock poisoned");
        if current.is_pending() {
            *current = status;
        }
    }

    /// Records the response and transitions to ResponseReceived. Returns the
    /// response callback, if any, for the caller to invoke on a worker.
    pub(super) fn resolve(&self, response: Message) -> Option<ResponseCallback> {
        *self.response.lock().expect("lock poisoned") = Some(response);
        self.set_status(MessageStatus::ResponseReceived);
        self.on_response.lock().expect("lock poisoned").take()
    }
}

/// Generates per-sender message ids: atomic, monotonic, skipping zero on
/// wrap since zero marks "not a response".
pub(super) struct IdGenerator(AtomicU32);

impl IdGenerator {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_skips_zero_on_wrap() {
        let ids = IdGenerator(AtomicU32::new(u32::MAX));
        assert_eq!(ids.next(), u32::MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn status_lifecycle() {
        let message = Message::request(NodeId::new("a", 1), kind::LEADER_REQUEST, Value::empty());
        let delivery = Delivery::new(message, SendOptions::default());
        assert_eq!(delivery.status(), MessageStatus::Created);

        delivery.set_status(MessageStatus::Sending);
        delivery.set_status(MessageStatus::WaitingForResponse);
        assert!(delivery.status().is_pending());

        let response = Message::respond(
            delivery.message(),
            kind::LEADER_RESPONSE,
            Value::document([("Leader", "a:1")]),
        );
        delivery.resolve(response);
        assert_eq!(delivery.status(), MessageStatus::ResponseReceived);
        assert!(delivery.succeeded());

        // Terminal statuses are absorbing.
        delivery.set_status(MessageStatus::ResponseFailure);
        assert_eq!(delivery.status(), MessageStatus::ResponseReceived);
        assert_eq!(delivery.response().unwrap().kind, kind::LEADER_RESPONSE);
    }

    #[test]
    fn respond_flips_correlation() {
        let mut request = Message::request(NodeId::new("a", 1), kind::LEADER_REQUEST, Value::empty());
        request.id = 7;
        request.direction = Direction::Incoming;
        let response = Message::respond(&request, kind::LEADER_RESPONSE, Value::empty());
        assert_eq!(response.in_response_to, 7);
        assert_eq!(response.address, request.address);
        assert_eq!(response.direction, Direction::Incoming);
        assert!(!response.waiting_for_response);
    }
}
