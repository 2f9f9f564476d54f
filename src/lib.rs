//! Chain-replicated distributed bookstore.
//!
//! A cluster of nodes hosts logical processes that are linked into one
//! global chain (CRAQ-style chain replication with apportioned reads).
//! Writes enter at the chain head and propagate hop by hop to the tail; the
//! tail is the point of consistency and acknowledges values back upstream,
//! flipping each replica's copy from *dirty* to *clean*. Reads are served
//! locally only from a clean copy; anything else defers to the tail.
//!
//! # Architecture
//!
//! Each node runs a small set of threads:
//!
//! - **Worker thread**: owns all node state (processes, stores, chain view)
//!   and applies every operation, keeping each store single-writer.
//! - **Listener + connection handler threads**: accept peer calls and relay
//!   them to the worker over crossbeam channels.
//! - **Hop threads**: one per scheduled propagation step; each waits out the
//!   configured propagation delay and then issues one blocking call to the
//!   next process's owner. Handlers return after scheduling, so the chain
//!   settles in the background.
//!
//! The propagation delay is an experiment knob, not a correctness mechanism:
//! it widens the window in which reads can observe dirty state. Setting it
//! to zero degenerates to synchronous chain replication.
//!
//! # Modules
//!
//! - [`store`]: books and their per-replica dirty/clean status
//! - [`process`]: structured process identity and per-process state
//! - [`message`]: length-prefixed bincode wire protocol and remote calls
//! - [`node`]: chain protocol logic (linking, write/clean application, read routing)
//! - [`runtime`]: worker loop, network handling, node spawning
//! - [`topology`]: cluster-wide chain construction and inspection
//! - [`protocol`]: shell command parsing

pub mod message;
pub mod node;
pub mod process;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod topology;

pub use node::{Node, NodeStatus, ReadRoute};
pub use process::{Process, ProcessId};
pub use runtime::{spawn_node, NodeConfig, NodeHandle};
pub use store::{Book, Entry, Store};
