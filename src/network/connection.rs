use super::frame;
use super::NodeId;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Timeout for dialing a peer. Redials are serialized in the maintenance
/// loop, so a dead peer must not stall it for long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for writing a single frame. A peer that can't take a frame
/// within this window is treated as dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes a full frame to a peer socket. The socket is non-blocking (it
/// shares its file description with the polled reader half), so partial
/// writes and WouldBlock are retried with a short sleep up to the deadline.
pub(super) fn write_frame(socket: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    let deadline = Instant::now() + WRITE_TIMEOUT;
    let mut offset = 0;
    while offset < frame.len() {
        match socket.write(&frame[offset..]) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => offset += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(std::io::ErrorKind::TimedOut.into());
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    socket.flush()
}

/// Which registry a connection (or the message traveling it) belongs to.
/// A pair of peers that both dial each other ends up with two sockets,
/// one per direction, tracked independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        })
    }
}

/// The connection lifecycle. Identifying → Connected on a successful join
/// handshake; any terminal failure → Disconnected, which is absorbing. A
/// Disconnected entry is swept from the registry before any new attempt on
/// the same key can succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Identifying,
    Connected,
    Disconnected,
}

/// A registered peer socket. The reader half and its receive buffer are
/// polled by the network's receive loop under the registry lock; the writer
/// half is shared with the send workers, serialized by its own mutex so
/// concurrent sends cannot interleave frames.
pub struct Connection {
    reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    status: ConnectionStatus,
    buffer: Vec<u8>,
}

impl Connection {
    fn new(socket: TcpStream) -> Result<Self> {
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let writer = Arc::new(Mutex::new(socket.try_clone()?));
        Ok(Self { reader: socket, writer, status: ConnectionStatus::Identifying, buffer: Vec::new() })
    }

    /// Drains available bytes from the socket into the receive buffer.
    /// Returns false when the socket is dead (closed or failed).
    fn drain(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Frames and dead sockets gathered by a single poll pass.
#[derive(Default)]
pub struct Poll {
    /// Complete frame bodies, in per-connection arrival order.
    pub frames: Vec<(NodeId, Direction, Vec<u8>)>,
    /// Connections whose socket died during the pass.
    pub dead: Vec<(NodeId, Direction)>,
}

/// The dual connection registry: incoming and outgoing peers tracked
/// separately, each mapping under its own readers-writer lock, plus the set
/// of peers this node wants to keep outgoing connections to. At most one
/// entry per direction exists for a given peer.
pub struct Registry {
    incoming: RwLock<HashMap<NodeId, Connection>>,
    outgoing: RwLock<HashMap<NodeId, Connection>>,
    desired: RwLock<HashSet<NodeId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            incoming: RwLock::new(HashMap::new()),
            outgoing: RwLock::new(HashMap::new()),
            desired: RwLock::new(HashSet::new()),
        }
    }

    fn map(&self, direction: Direction) -> &RwLock<HashMap<NodeId, Connection>> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    /// Registers an accepted client under its provisional (ip, port) key.
    /// The join handshake later re-keys it to the peer's advertised name.
    pub fn accept(&self, socket: TcpStream, provisional: NodeId) -> Result<()> {
        let connection = Connection::new(socket)?;
        let mut incoming = self.incoming.write().expect("lock poisoned");
        self.sweep(&mut incoming, &provisional);
        incoming.insert(provisional, connection);
        Ok(())
    }

    /// Opens an outgoing connection and registers it as Identifying.
    /// Idempotent if a live connection is already present; a Disconnected
    /// leftover is swept first.
    pub fn open_outgoing(&self, target: &NodeId) -> Result<()> {
        {
            let mut outgoing = self.outgoing.write().expect("lock poisoned");
            self.sweep(&mut outgoing, target);
            if outgoing.contains_key(target) {
                return Ok(());
            }
        }

        // Dial outside the lock, then re-check on insert: a concurrent dial
        // of the same peer keeps the first connection.
        let socket = self.dial(target)?;
        let connection = Connection::new(socket)?;
        let mut outgoing = self.outgoing.write().expect("lock poisoned");
        self.sweep(&mut outgoing, target);
        outgoing.entry(target.clone()).or_insert(connection);
        Ok(())
    }

    fn dial(&self, target: &NodeId) -> Result<TcpStream> {
        let mut last = None;
        for addr in target.socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(socket) => return Ok(socket),
                Err(err) => last = Some(err),
            }
        }
        Err(last.map(Error::from).unwrap_or_else(|| Error::Network(format!("can't dial {target}"))))
    }

    /// Removes a Disconnected entry under the key, dropping its buffer.
    fn sweep(&self, map: &mut HashMap<NodeId, Connection>, key: &NodeId) {
        if map.get(key).map(|c| c.status) == Some(ConnectionStatus::Disconnected) {
            map.remove(key);
        }
    }

    /// Re-keys an incoming connection from its provisional (ip, port) key to
    /// the advertised name learned from the join handshake. The receive
    /// buffer moves with the entry.
    pub fn rename_incoming(&self, provisional: &NodeId, advertised: &NodeId) {
        let mut incoming = self.incoming.write().expect("lock poisoned");
        if let Some(connection) = incoming.remove(provisional) {
            if incoming.insert(advertised.clone(), connection).is_some() {
                debug!("Replaced incoming connection from {advertised}");
            }
        }
    }

    /// Transitions a connection's status. Returns false if the entry is
    /// missing. Disconnected is absorbing.
    pub fn set_status(&self, direction: Direction, key: &NodeId, status: ConnectionStatus) -> bool {
        let mut map = self.map(direction).write().expect("lock poisoned");
        match map.get_mut(key) {
            Some(connection) if connection.status != ConnectionStatus::Disconnected => {
                connection.status = status;
                true
            }
            _ => false,
        }
    }

    /// Sweeps a connection out of the registry, dropping its socket and
    /// receive buffer. Returns whether an entry was removed.
    pub fn remove(&self, direction: Direction, key: &NodeId) -> bool {
        self.map(direction).write().expect("lock poisoned").remove(key).is_some()
    }

    /// Returns the writer half and status of a connection, for a send
    /// worker to use after releasing the registry lock.
    pub fn writer(
        &self,
        direction: Direction,
        key: &NodeId,
    ) -> Option<(Arc<Mutex<TcpStream>>, ConnectionStatus)> {
        let map = self.map(direction).read().expect("lock poisoned");
        map.get(key).map(|c| (c.writer.clone(), c.status))
    }

    /// Snapshot of connected peers in one direction.
    pub fn connected(&self, direction: Direction) -> Vec<NodeId> {
        let map = self.map(direction).read().expect("lock poisoned");
        map.iter()
            .filter(|(_, c)| c.status == ConnectionStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Snapshot of every live (non-Disconnected) peer in one direction.
    pub fn registered(&self, direction: Direction) -> Vec<NodeId> {
        let map = self.map(direction).read().expect("lock poisoned");
        map.iter()
            .filter(|(_, c)| c.status != ConnectionStatus::Disconnected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The set of peers connected in either direction, sorted and deduped.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.connected(Direction::Outgoing);
        nodes.extend(self.connected(Direction::Incoming));
        nodes.into_iter().sorted().dedup().collect()
    }

    /// Drains every registered socket into its receive buffer and extracts
    /// all complete frames, in strict per-connection arrival order.
    pub fn poll(&self) -> Poll {
        let mut poll = Poll::default();
        for direction in [Direction::Incoming, Direction::Outgoing] {
            let mut map = self.map(direction).write().expect("lock poisoned");
            for (key, connection) in map.iter_mut() {
                if connection.status == ConnectionStatus::Disconnected {
                    continue;
                }
                if !connection.drain() {
                    poll.dead.push((key.clone(), direction));
                }
                // A dying socket may still have delivered complete frames.
                while let Some(body) = frame::extract(&mut connection.buffer) {
                    poll.frames.push((key.clone(), direction, body));
                }
            }
        }
        poll
    }

    /// Drops every connection, closing the sockets. The desired set is
    /// kept; it belongs to the caller's configuration, not the sockets.
    pub fn clear(&self) {
        self.incoming.write().expect("lock poisoned").clear();
        self.outgoing.write().expect("lock poisoned").clear();
    }

    /// Adds a peer to the desired set.
    pub fn desire(&self, peer: NodeId) {
        self.desired.write().expect("lock poisoned").insert(peer);
    }

    /// Removes a peer from the desired set.
    pub fn undesire(&self, peer: &NodeId) {
        self.desired.write().expect("lock poisoned").remove(peer);
    }

    /// Desired peers with no live outgoing connection, for the maintenance
    /// loop to redial.
    pub fn desired_missing(&self) -> Vec<NodeId> {
        let outgoing = self.outgoing.read().expect("lock poisoned");
        let desired = self.desired.read().expect("lock poisoned");
        desired
            .iter()
            .filter(|peer| {
                outgoing.get(peer).map(|c| c.status) != Some(ConnectionStatus::Connected)
                    && outgoing.get(peer).map(|c| c.status) != Some(ConnectionStatus::Identifying)
            })
            .cloned()
            .collect()
    }
}
