//! The message-oriented peer network: a full-duplex multi-peer transport
//! with framed messages, request/response correlation, heartbeats, expiry,
//! and reconnection over a dual (incoming/outgoing) connection registry.
//!
//! The engine runs on plain threads: an accept loop, a receive loop that
//! polls all registered sockets into per-connection buffers, a bounded
//! worker pool for sends, a bounded worker pool delivering completed
//! messages to handlers, and heartbeat/maintenance loops. All loops observe
//! a shared running flag and shut down cooperatively within one tick.

mod address;
mod connection;
mod frame;
mod message;

pub use address::NodeId;
pub use connection::{ConnectionStatus, Direction};
pub use message::{
    kind, Delivery, Message, MessageStatus, ResponseCallback, SendOptions, DEFAULT_TIMEOUT,
};

use connection::Registry;
use message::IdGenerator;

use crate::document::Value;
use crate::error::Result;
use crate::util::responsive_sleep;

use crossbeam::channel;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between heartbeats on every registered connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Tick of the maintenance loop, which drives waiter expiry.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);
/// Interval between redial sweeps over the desired peer set.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Receive loop idle sleep when no socket had bytes available.
const RECEIVE_IDLE: Duration = Duration::from_millis(10);
/// Spin interval of block_until_done.
const BLOCK_POLL: Duration = Duration::from_millis(10);
/// Response timeout of the join handshake.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Size of the send worker pool.
const SEND_WORKERS: usize = 4;
/// Size of the handler delivery worker pool.
const HANDLER_WORKERS: usize = 4;

/// A higher-layer module consuming the network. Methods are invoked on
/// handler pool threads and must not block on network responses.
pub trait Handler: Send + Sync {
    /// Handles an incoming message. Returns true if the message was
    /// consumed; unconsumed messages fall through to the generic
    /// subscribers.
    fn message(&self, message: &Message) -> bool;

    /// Notifies the module that a peer connection was lost.
    fn disconnected(&self, peer: &NodeId);
}

/// A unit of work for the handler pool.
enum Work {
    /// Deliver an incoming message to the handlers.
    Deliver(Message),
    /// Invoke a delivery's response callback.
    Respond(Arc<Delivery>, ResponseCallback),
    /// Notify handlers of a lost peer.
    Disconnected(NodeId),
}

/// The peer network engine. Cheap to share: all state is behind its own
/// lock, and the public surface (send, connect, snapshots, handler
/// registration) is callable from any thread.
pub struct Network {
    /// The advertised name of this node.
    name: NodeId,
    /// The dual connection registry and desired peer set.
    registry: Registry,
    /// In-flight requests awaiting responses, keyed by message id.
    waiters: Mutex<HashMap<u32, Arc<Delivery>>>,
    /// The message id generator.
    ids: IdGenerator,
    /// Send pool channel.
    send_tx: channel::Sender<Arc<Delivery>>,
    send_rx: channel::Receiver<Arc<Delivery>>,
    /// Handler pool channel.
    work_tx: channel::Sender<Work>,
    work_rx: channel::Receiver<Work>,
    /// Registered module handlers, in registration order.
    handlers: RwLock<Vec<Weak<dyn Handler>>>,
    /// Generic subscribers for messages no handler consumed.
    subscribers: RwLock<Vec<Box<dyn Fn(&Message) + Send + Sync>>>,
    /// Cooperative shutdown flag, shared with every loop.
    running: Arc<AtomicBool>,
    /// Background thread handles, joined on shutdown.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    /// Creates a network for the given advertised node name. No threads are
    /// started until serve().
    pub fn new(name: NodeId) -> Arc<Self> {
        let (send_tx, send_rx) = channel::unbounded();
        let (work_tx, work_rx) = channel::unbounded();
        Arc::new(Self {
            name,
            registry: Registry::new(),
            waiters: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
            send_tx,
            send_rx,
            work_tx,
            work_rx,
            handlers: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(true)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The advertised name of this node.
    pub fn name(&self) -> &NodeId {
        &self.name
    }

    /// The shared running flag, for sibling services that shut down with
    /// the network.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Binds the listen port and starts the background loops.
    pub fn serve(self: &Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("Listening on {}, advertising as {}", listener.local_addr()?, self.name);

        let mut threads = self.threads.lock().expect("lock poisoned");
        let network = self.clone();
        threads.push(std::thread::spawn(move || network.accept_loop(listener)));
        let network = self.clone();
        threads.push(std::thread::spawn(move || network.receive_loop()));
        let network = self.clone();
        threads.push(std::thread::spawn(move || network.maintenance_loop()));
        let network = self.clone();
        threads.push(std::thread::spawn(move || network.heartbeat_loop()));
        for _ in 0..SEND_WORKERS {
            let network = self.clone();
            threads.push(std::thread::spawn(move || network.send_loop()));
        }
        for _ in 0..HANDLER_WORKERS {
            let network = self.clone();
            threads.push(std::thread::spawn(move || network.work_loop()));
        }
        Ok(())
    }

    /// Stops all background loops and joins them. The loops observe the
    /// flag within one responsive-sleep increment; a thread that still
    /// fails to join is a bug, so it is logged rather than tolerated.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let threads = std::mem::take(&mut *self.threads.lock().expect("lock poisoned"));
        for thread in threads {
            if thread.join().is_err() {
                error!("Network thread panicked during shutdown");
            }
        }
        // Close the peer sockets so the other side notices promptly.
        self.registry.clear();
    }

    /// Registers a module handler. Handlers are held weakly: a dropped
    /// module simply stops receiving messages.
    pub fn register(&self, handler: Weak<dyn Handler>) {
        let mut handlers = self.handlers.write().expect("lock poisoned");
        handlers.retain(|h| h.strong_count() > 0);
        handlers.push(handler);
    }

    /// Subscribes to messages that no registered handler consumed.
    pub fn subscribe(&self, subscriber: Box<dyn Fn(&Message) + Send + Sync>) {
        self.subscribers.write().expect("lock poisoned").push(subscriber);
    }

    /// Sends a message with default options. Non-blocking: registers the
    /// waiter if a response is expected, then hands the message to the send
    /// pool. The returned delivery tracks the outcome.
    pub fn send(&self, message: Message) -> Arc<Delivery> {
        self.send_with(message, SendOptions::default())
    }

    /// Sends a message with explicit options.
    pub fn send_with(&self, mut message: Message, options: SendOptions) -> Arc<Delivery> {
        message.id = self.ids.next();
        let delivery = Arc::new(Delivery::new(message, options));
        delivery.set_status(MessageStatus::Sending);

        // The waiter must be registered before any byte reaches the socket,
        // or a fast response could arrive with nothing to correlate to.
        if delivery.message().waiting_for_response {
            let mut waiters = self.waiters.lock().expect("lock poisoned");
            waiters.insert(delivery.message().id, delivery.clone());
        }

        if self.send_tx.send(delivery.clone()).is_err() {
            self.fail_delivery(&delivery, MessageStatus::SendingFailure);
        }
        delivery
    }

    /// Sends a request and blocks until its terminal status, returning the
    /// response if one arrived.
    pub fn call(&self, message: Message, timeout: Duration) -> Option<Message> {
        let delivery = self.send_with(message, SendOptions::timeout(timeout));
        self.block_until_done(&delivery);
        delivery.response()
    }

    /// Spins with a small sleep until the delivery leaves its in-flight
    /// statuses, or the network shuts down. The maintenance loop is the
    /// primary driver of timeouts, but it may itself be the caller here
    /// (redialing a peer that accepted the socket and went mute), so past
    /// one grace tick the waiter is timed out locally.
    pub fn block_until_done(&self, delivery: &Delivery) {
        let deadline = delivery.expires_at() + MAINTENANCE_TICK;
        while delivery.status().is_pending() && self.running.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                self.fail_delivery(delivery, MessageStatus::ResponseTimeout);
                return;
            }
            std::thread::sleep(BLOCK_POLL);
        }
    }

    /// Adds a peer to the desired set and attempts the join handshake.
    /// Returns whether the peer is connected; failed peers are retried by
    /// the maintenance loop.
    pub fn connect(&self, peer: NodeId) -> bool {
        if peer == self.name {
            debug!("Ignoring connection to self");
            return false;
        }
        self.registry.desire(peer.clone());
        self.attempt_join(&peer)
    }

    /// Removes a peer from the desired set and drops its outgoing
    /// connection.
    pub fn disconnect(&self, peer: &NodeId) {
        self.registry.undesire(peer);
        self.drop_connection(Direction::Outgoing, peer);
    }

    /// The set of peers connected in either direction, sorted.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.registry.connected_nodes()
    }

    /// Sends a one-way message to every connected peer. Peers connected in
    /// both directions receive it once, over the outgoing connection.
    pub fn broadcast(&self, kind: &str, payload: Value) {
        let outgoing = self.registry.connected(Direction::Outgoing);
        for peer in self.registry.connected(Direction::Incoming) {
            if !outgoing.contains(&peer) {
                let message = Message::event(peer, kind, payload.clone())
                    .with_direction(Direction::Incoming);
                self.send(message);
            }
        }
        for peer in outgoing {
            self.send(Message::event(peer, kind, payload.clone()));
        }
    }

    /// Opens the outgoing connection and runs the join handshake: a
    /// JoinRequest carrying our advertised name, answered by JoinResult.
    /// Only this handshake may travel a connection still identifying.
    fn attempt_join(&self, peer: &NodeId) -> bool {
        if let Err(err) = self.registry.open_outgoing(peer) {
            debug!("Can't reach {peer}: {err}");
            return false;
        }
        if let Some((_, ConnectionStatus::Connected)) = self.registry.writer(Direction::Outgoing, peer)
        {
            return true;
        }

        let request = Message::request(
            peer.clone(),
            kind::JOIN_REQUEST,
            Value::document([("Address", self.name.name())]),
        );
        let options = SendOptions {
            timeout: JOIN_TIMEOUT,
            require_established: false,
            on_response: None,
        };
        let delivery = self.send_with(request, options);
        self.block_until_done(&delivery);

        if delivery.succeeded() {
            self.registry.set_status(Direction::Outgoing, peer, ConnectionStatus::Connected);
            info!("Connected to {peer}");
            return true;
        }
        debug!("Join handshake with {peer} failed ({:?})", delivery.status());
        self.drop_connection(Direction::Outgoing, peer);
        false
    }

    /// Tears down a connection: marks it disconnected, sweeps the entry and
    /// its receive buffer, fails every waiter targeting the peer over it,
    /// and notifies the handlers.
    fn drop_connection(&self, direction: Direction, peer: &NodeId) {
        if !self.registry.set_status(direction, peer, ConnectionStatus::Disconnected) {
            return;
        }
        self.registry.remove(direction, peer);
        info!("Disconnected from {peer} ({direction})");

        let failed: Vec<Arc<Delivery>> = {
            let mut waiters = self.waiters.lock().expect("lock poisoned");
            let ids: Vec<u32> = waiters
                .iter()
                .filter(|(_, d)| {
                    d.message().address == *peer && d.message().direction == direction
                })
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| waiters.remove(id)).collect()
        };
        for delivery in failed {
            delivery.set_status(MessageStatus::ResponseFailure);
        }

        let _ = self.work_tx.send(Work::Disconnected(peer.clone()));
    }

    /// Fails a delivery and deregisters its waiter.
    fn fail_delivery(&self, delivery: &Delivery, status: MessageStatus) {
        delivery.set_status(status);
        self.waiters.lock().expect("lock poisoned").remove(&delivery.message().id);
    }

    /// Accepts clients until shutdown. Accepted sockets are registered
    /// under their provisional (ip, port) key; the join handshake re-keys
    /// them. The listener is non-blocking so a shutdown is observed within
    /// one tick, and closing it simply ends the loop.
    fn accept_loop(&self, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((socket, addr)) => {
                    let provisional = NodeId::new(&addr.ip().to_string(), addr.port());
                    debug!("Accepted client {provisional}");
                    if let Err(err) = self.registry.accept(socket, provisional) {
                        warn!("Failed to register accepted client: {err}");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!("Accept failed: {err}");
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Polls every registered socket, extracts complete frames in per-peer
    /// arrival order, and dispatches them.
    fn receive_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let poll = self.registry.poll();
            let idle = poll.frames.is_empty();
            for (peer, direction) in poll.dead {
                self.drop_connection(direction, &peer);
            }
            for (peer, direction, body) in poll.frames {
                match frame::decode(&body, peer, direction) {
                    Ok(message) => self.dispatch(message),
                    // Malformed frames are dropped; the connection survives.
                    Err(err) => debug!("Dropping malformed frame: {err}"),
                }
            }
            if idle {
                std::thread::sleep(RECEIVE_IDLE);
            }
        }
    }

    /// Routes a received message: response correlation first, then the join
    /// handshake, then handler delivery on a pool thread.
    fn dispatch(&self, message: Message) {
        if message.in_response_to != 0 {
            let waiter =
                self.waiters.lock().expect("lock poisoned").remove(&message.in_response_to);
            match waiter {
                Some(delivery) => {
                    if let Some(callback) = delivery.resolve(message) {
                        let _ = self.work_tx.send(Work::Respond(delivery, callback));
                    }
                }
                None => debug!("Dropping response {} with no waiter", message.in_response_to),
            }
            return;
        }

        match message.kind.as_str() {
            kind::JOIN_REQUEST => self.handle_join(message),
            // Heartbeats only exist to surface dead sockets on the sender.
            kind::HEARTBEAT => {}
            _ => {
                let _ = self.work_tx.send(Work::Deliver(message));
            }
        }
    }

    /// Handles a peer's join handshake: re-keys the incoming connection
    /// from its provisional address to the advertised one, marks it
    /// connected, and confirms with JoinResult.
    fn handle_join(&self, message: Message) {
        let Some(advertised) = message.payload.get_str("Address").map(str::parse) else {
            debug!("Dropping JoinRequest without address");
            return;
        };
        let advertised: NodeId = match advertised {
            Ok(advertised) => advertised,
            Err(err) => {
                debug!("Dropping JoinRequest with bad address: {err}");
                return;
            }
        };

        self.registry.rename_incoming(&message.address, &advertised);
        self.registry.set_status(Direction::Incoming, &advertised, ConnectionStatus::Connected);
        info!("Peer {advertised} joined");

        let mut reply = Message::respond(&message, kind::JOIN_RESULT, Value::empty());
        reply.address = advertised;
        self.send(reply);
    }

    /// Writes queued frames to peer sockets. On failure the message
    /// collapses to SendingFailure and the connection is torn down; errors
    /// never escape the worker.
    fn send_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let delivery = match self.send_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(delivery) => delivery,
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => return,
            };
            self.send_frame(&delivery);
        }
    }

    fn send_frame(&self, delivery: &Delivery) {
        let message = delivery.message();
        let Some((writer, status)) = self.registry.writer(message.direction, &message.address)
        else {
            debug!("No {} connection to {} for {}", message.direction, message.address, message.kind);
            self.fail_delivery(delivery, MessageStatus::SendingFailure);
            return;
        };
        if status == ConnectionStatus::Disconnected
            || (status == ConnectionStatus::Identifying && delivery.require_established())
        {
            self.fail_delivery(delivery, MessageStatus::SendingFailure);
            return;
        }

        let frame = match frame::encode(message) {
            Ok(frame) => frame,
            Err(err) => {
                error!("Failed to encode {}: {err}", message.kind);
                self.fail_delivery(delivery, MessageStatus::SendingFailure);
                return;
            }
        };

        let result = {
            let mut socket = writer.lock().expect("lock poisoned");
            connection::write_frame(&mut socket, &frame)
        };
        match result {
            Ok(()) => {
                let status = if message.waiting_for_response {
                    MessageStatus::WaitingForResponse
                } else {
                    MessageStatus::Sent
                };
                delivery.set_status(status);
            }
            Err(err) => {
                debug!("Send of {} to {} failed: {err}", message.kind, message.address);
                self.fail_delivery(delivery, MessageStatus::SendingFailure);
                self.drop_connection(message.direction, &message.address);
            }
        }
    }

    /// Delivers completed work to module handlers and response callbacks.
    fn work_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let work = match self.work_rx.recv_timeout(Duration::from_millis(250)) {
                Ok(work) => work,
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => return,
            };
            match work {
                Work::Deliver(message) => self.deliver(&message),
                Work::Respond(delivery, callback) => {
                    if let Some(response) = delivery.response() {
                        callback(&response);
                    }
                }
                Work::Disconnected(peer) => {
                    for handler in self.handlers.read().expect("lock poisoned").iter() {
                        if let Some(handler) = handler.upgrade() {
                            handler.disconnected(&peer);
                        }
                    }
                }
            }
        }
    }

    fn deliver(&self, message: &Message) {
        for handler in self.handlers.read().expect("lock poisoned").iter() {
            if let Some(handler) = handler.upgrade() {
                if handler.message(message) {
                    return;
                }
            }
        }
        for subscriber in self.subscribers.read().expect("lock poisoned").iter() {
            subscriber(message);
        }
    }

    /// Expires overdue waiters every tick and redials missing desired
    /// peers every reconnect interval. This loop is the sole driver of
    /// timeout transitions.
    fn maintenance_loop(&self) {
        let mut last_redial = Instant::now();
        while responsive_sleep(&self.running, MAINTENANCE_TICK) {
            self.expire_waiters();
            if last_redial.elapsed() >= RECONNECT_INTERVAL {
                last_redial = Instant::now();
                for peer in self.registry.desired_missing() {
                    debug!("Redialing {peer}");
                    self.attempt_join(&peer);
                }
            }
        }
    }

    fn expire_waiters(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Delivery>> = {
            let mut waiters = self.waiters.lock().expect("lock poisoned");
            let ids: Vec<u32> = waiters
                .iter()
                .filter(|(_, d)| d.expires_at() < now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| waiters.remove(id)).collect()
        };
        for delivery in expired {
            debug!("Request {} to {} timed out", delivery.message().id, delivery.message().address);
            delivery.set_status(MessageStatus::ResponseTimeout);
        }
    }

    /// Sends a fire-and-forget heartbeat on every registered connection in
    /// both directions. The reply is irrelevant; a dead socket surfaces as
    /// a send failure, which tears the connection down.
    fn heartbeat_loop(&self) {
        while responsive_sleep(&self.running, HEARTBEAT_INTERVAL) {
            for direction in [Direction::Incoming, Direction::Outgoing] {
                for peer in self.registry.registered(direction) {
                    let message =
                        Message::event(peer, kind::HEARTBEAT, Value::empty()).with_direction(direction);
                    let options = SendOptions { require_established: false, ..SendOptions::default() };
                    self.send_with(message, options);
                }
            }
        }
    }
}
