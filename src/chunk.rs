//! The lookup table of database chunks: key ranges partitioned by markers,
//! each owned by a node. The table only supports exact-endpoint mutations —
//! splitting a chunk at a marker, joining two adjacent chunks, and handing
//! a chunk to a new owner. Well-ordering of the markers along the key axis
//! is the caller's contract, not enforced here.

use crate::network::NodeId;

use std::sync::RwLock;

/// An open endpoint of a chunk: the start or end of the whole key axis, or
/// a concrete key value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
    Value(String),
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Start => f.write_str("<start>"),
            Self::End => f.write_str("<end>"),
            Self::Value(key) => f.write_str(key),
        }
    }
}

impl From<&str> for Marker {
    fn from(key: &str) -> Self {
        Marker::Value(key.to_owned())
    }
}

/// A chunk: a key interval with an owning node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub start: Marker,
    pub end: Marker,
    pub owner: NodeId,
}

/// The in-memory chunk set, under a single writer lock. All three mutators
/// locate chunks by exact endpoint equality and leave the table untouched
/// when no match exists.
pub struct ChunkTable {
    chunks: RwLock<Vec<Chunk>>,
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { chunks: RwLock::new(Vec::new()) }
    }

    /// Creates a table holding the whole key axis as one chunk.
    pub fn seed(owner: NodeId) -> Self {
        let table = Self::new();
        table.chunks.write().expect("lock poisoned").push(Chunk {
            start: Marker::Start,
            end: Marker::End,
            owner,
        });
        table
    }

    /// Splits the chunk with exactly the endpoints (start, end) at the mid
    /// marker, assigning both halves to the new owner. Returns false
    /// without modification if no such chunk exists. The split point is
    /// not validated against well-ordering.
    pub fn split(&self, start: &Marker, end: &Marker, mid: Marker, owner: NodeId) -> bool {
        let mut chunks = self.chunks.write().expect("lock poisoned");
        let Some(index) =
            chunks.iter().position(|c| c.start == *start && c.end == *end)
        else {
            return false;
        };
        chunks.remove(index);
        chunks.push(Chunk { start: start.clone(), end: mid.clone(), owner: owner.clone() });
        chunks.push(Chunk { start: mid, end: end.clone(), owner });
        true
    }

    /// Joins the two chunks with exactly the endpoints (start1, end1) and
    /// (start2, end2) into one spanning (start1, end2), owned by the new
    /// owner. Returns false without modification if either is missing.
    pub fn join(
        &self,
        start1: &Marker,
        end1: &Marker,
        start2: &Marker,
        end2: &Marker,
        owner: NodeId,
    ) -> bool {
        let mut chunks = self.chunks.write().expect("lock poisoned");
        let Some(first) = chunks.iter().position(|c| c.start == *start1 && c.end == *end1) else {
            return false;
        };
        let Some(second) = chunks.iter().position(|c| c.start == *start2 && c.end == *end2) else {
            return false;
        };
        // Remove the higher index first so the lower one stays valid.
        for index in [first.max(second), first.min(second)] {
            chunks.remove(index);
        }
        chunks.push(Chunk { start: start1.clone(), end: end2.clone(), owner });
        true
    }

    /// Reassigns the chunk with exactly the endpoints (start, end) to a
    /// new owner, returning whether it was found.
    pub fn update_owner(&self, start: &Marker, end: &Marker, owner: NodeId) -> bool {
        let mut chunks = self.chunks.write().expect("lock poisoned");
        match chunks.iter_mut().find(|c| c.start == *start && c.end == *end) {
            Some(chunk) => {
                chunk.owner = owner;
                true
            }
            None => false,
        }
    }

    /// A snapshot of the table contents.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.chunks.read().expect("lock poisoned").clone()
    }

    /// The number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.read().expect("lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
