//! meshdb is a peer-to-peer clustered database runtime. Nodes discover
//! each other over TCP and exchange framed request/response messages;
//! controller nodes elect a single leader by majority vote with monotonic
//! terms, or — as an alternative topology — organize into a Chord-style
//! hash ring. Each node owns a lookup table of database chunks partitioned
//! by key-range markers.

#![warn(clippy::all)]

pub mod chord;
pub mod chunk;
pub mod document;
pub mod election;
pub mod error;
pub mod network;
pub mod util;
pub mod web;

pub use error::{Error, Result};
pub use network::Network;
