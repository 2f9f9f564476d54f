//! Chain process identity and state.
//!
//! A process is a single logical chain replica. Each node hosts one or more
//! of them, and the topology build links all processes cluster-wide into one
//! chain. The identifier is structured: ownership is always derived from the
//! `host` field, never by parsing a display string.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::store::Store;

/// Identifies a process: the owning host and a per-host sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId {
    pub host: u64,
    pub seq: u32,
}

impl ProcessId {
    pub fn new(host: u64, seq: u32) -> Self {
        Self { host, seq }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{}-ps{}", self.host, self.seq)
    }
}

impl FromStr for ProcessId {
    type Err = anyhow::Error;

    /// Parses the display form, `Node{host}-ps{seq}`. Used only where an
    /// operator types an id at the shell.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("Node")
            .with_context(|| format!("invalid process id '{s}', expected Node<host>-ps<seq>"))?;
        let (host, seq) = rest
            .split_once("-ps")
            .with_context(|| format!("invalid process id '{s}', expected Node<host>-ps<seq>"))?;
        Ok(Self {
            host: host
                .parse()
                .with_context(|| format!("invalid host in process id '{s}'"))?,
            seq: seq
                .parse()
                .with_context(|| format!("invalid sequence in process id '{s}'"))?,
        })
    }
}

/// A chain replica: identity, local book storage, and its links in the
/// current chain. Links are `None` until a chain is built; the process with
/// no predecessor is the head, the one with no successor is the tail.
#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    pub store: Store,
    pub successor: Option<ProcessId>,
    pub predecessor: Option<ProcessId>,
}

impl Process {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            store: Store::new(),
            successor: None,
            predecessor: None,
        }
    }

    /// Discards all stored data and detaches the process from the chain.
    /// Run on every process before a rebuild links a new chain.
    pub fn reset(&mut self) {
        self.store = Store::new();
        self.successor = None;
        self.predecessor = None;
    }
}
