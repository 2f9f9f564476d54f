//! Node state and chain protocol logic.
//!
//! A [`Node`] owns every process hosted on one machine plus the node's view
//! of the global chain (head, tail, propagation delay). All mutation happens
//! on the worker thread that owns the `Node`, which keeps each store
//! single-writer without locks.
//!
//! The write and clean handlers are pure with respect to the network: they
//! mutate local state and return the propagation [`Hop`]s the runtime must
//! schedule. This keeps the replication rules testable without sockets.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::message::{LinkAssignment, Request};
use crate::process::{Process, ProcessId};
use crate::store::{Book, Entry};

/// A deferred propagation step: after `after` elapses, deliver `request` to
/// the node owning `target`. Forward write hops and all clean hops except the
/// tail's first carry the configured propagation delay.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub after: Duration,
    pub target: ProcessId,
    pub request: Request,
}

/// Where a client read should be answered from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadRoute {
    /// The first local process holds a clean entry; its value matches the
    /// tail, so no network hop is needed.
    Local(Book),
    /// Local state is dirty or absent; only the tail is authoritative.
    ForwardToTail(ProcessId),
    /// No chain has been built yet.
    NoChain,
}

/// Per-process view used by status displays.
#[derive(Debug)]
pub struct ProcessStatus {
    pub id: ProcessId,
    pub successor: Option<ProcessId>,
    pub predecessor: Option<ProcessId>,
    pub entries: Vec<Entry>,
}

/// Snapshot of a node's state for the shell.
#[derive(Debug)]
pub struct NodeStatus {
    pub node_id: u64,
    pub head: Option<ProcessId>,
    pub tail: Option<ProcessId>,
    pub delay: Duration,
    pub processes: Vec<ProcessStatus>,
}

/// All chain state hosted on one machine.
pub struct Node {
    id: u64,
    processes: BTreeMap<ProcessId, Process>,
    head: Option<ProcessId>,
    tail: Option<ProcessId>,
    delay: Duration,
}

impl Node {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            processes: BTreeMap::new(),
            head: None,
            tail: None,
            delay: Duration::ZERO,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn head(&self) -> Option<ProcessId> {
        self.head
    }

    pub fn tail(&self) -> Option<ProcessId> {
        self.tail
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Creates `n` fresh local processes, numbering on from any that already
    /// exist. Local-only: the chain does not change until the next build.
    pub fn init_processes(&mut self, n: u32) -> Vec<ProcessId> {
        let base = self.processes.len() as u32;
        let mut created = Vec::with_capacity(n as usize);
        for offset in 1..=n {
            let id = ProcessId::new(self.id, base + offset);
            self.processes.insert(id, Process::new(id));
            created.push(id);
        }
        created
    }

    /// Ids of every local process.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.keys().copied().collect()
    }

    /// Wipes every local store and link. Rebuilding a chain destroys all
    /// previously stored data; this is the documented cost of `Create-chain`.
    pub fn clear_all(&mut self) {
        for process in self.processes.values_mut() {
            process.reset();
        }
        self.head = None;
        self.tail = None;
    }

    /// Applies this node's subset of link assignments from a chain build and
    /// records the global head and tail. Clears all local state first.
    pub fn apply_links(
        &mut self,
        head: ProcessId,
        tail: ProcessId,
        assignments: &[LinkAssignment],
    ) -> Result<()> {
        self.clear_all();
        for assignment in assignments {
            let process = self
                .processes
                .get_mut(&assignment.process)
                .with_context(|| {
                    format!("link assignment for unknown process {}", assignment.process)
                })?;
            process.successor = assignment.successor;
            process.predecessor = assignment.predecessor;
        }
        self.head = Some(head);
        self.tail = Some(tail);
        Ok(())
    }

    /// Local link state, one record per process.
    pub fn chain_links(&self) -> Vec<LinkAssignment> {
        self.processes
            .values()
            .map(|p| LinkAssignment {
                process: p.id,
                successor: p.successor,
                predecessor: p.predecessor,
            })
            .collect()
    }

    /// Applies a write at a local process and returns the hops to schedule.
    ///
    /// Mid-chain processes forward the write to their successor after the
    /// configured delay. The tail instead marks its own entry clean at once
    /// and starts clean propagation toward its predecessor with zero delay;
    /// every clean hop after that first one is delayed again.
    pub fn apply_write(&mut self, process_id: ProcessId, book: Book) -> Result<Vec<Hop>> {
        let delay = self.delay;
        let process = self
            .processes
            .get_mut(&process_id)
            .with_context(|| format!("write addressed to unknown process {process_id}"))?;

        process.store.upsert(book.clone());

        if let Some(successor) = process.successor {
            return Ok(vec![Hop {
                after: delay,
                target: successor,
                request: Request::Write {
                    process: successor,
                    book,
                },
            }]);
        }

        // This process is the tail: its value is authoritative the moment it
        // lands, so acknowledge upstream immediately.
        process.store.mark_clean(&book.name);
        Ok(match process.predecessor {
            Some(predecessor) => vec![Hop {
                after: Duration::ZERO,
                target: predecessor,
                request: Request::Clean {
                    process: predecessor,
                    book,
                },
            }],
            None => Vec::new(),
        })
    }

    /// Applies a clean-acknowledgement at a local process and returns the
    /// hops to schedule.
    ///
    /// The acknowledgement only applies while the live entry still holds the
    /// acknowledged price. A mismatch means a newer write for this name is
    /// already in flight past this point; the stale acknowledgement is
    /// dropped silently and propagation stops here.
    pub fn apply_clean(&mut self, process_id: ProcessId, book: Book) -> Result<Vec<Hop>> {
        let delay = self.delay;
        let process = self
            .processes
            .get_mut(&process_id)
            .with_context(|| format!("clean addressed to unknown process {process_id}"))?;

        let matches = process
            .store
            .get(&book.name)
            .is_some_and(|entry| entry.book.price == book.price);
        if !matches {
            tracing::debug!(
                process = %process_id,
                book = %book.name,
                price = book.price,
                "discarding stale clean-acknowledgement"
            );
            return Ok(Vec::new());
        }

        process.store.mark_clean(&book.name);
        Ok(match process.predecessor {
            Some(predecessor) => vec![Hop {
                after: delay,
                target: predecessor,
                request: Request::Clean {
                    process: predecessor,
                    book,
                },
            }],
            None => Vec::new(),
        })
    }

    /// Decides where a client read is answered from.
    ///
    /// Only a clean hit in the first local process may be served locally;
    /// everything else (dirty entry, locally absent name, node with no
    /// processes) defers to the tail, which is never stale.
    pub fn route_read(&self, name: &str) -> ReadRoute {
        if let Some(process) = self.processes.values().next() {
            if let Some(entry) = process.store.get(name) {
                if entry.clean {
                    return ReadRoute::Local(entry.book.clone());
                }
            }
        }
        match self.tail {
            Some(tail) => ReadRoute::ForwardToTail(tail),
            None => ReadRoute::NoChain,
        }
    }

    /// Authoritative lookup against the local tail process. Fails when this
    /// node does not own the global tail.
    pub fn tail_read(&self, name: &str) -> Result<Option<Book>> {
        let process = self.tail_process()?;
        Ok(process.store.get(name).map(|entry| entry.book.clone()))
    }

    /// Full catalog from the local tail process.
    pub fn tail_books(&self) -> Result<Vec<Book>> {
        Ok(self.tail_process()?.store.books())
    }

    fn tail_process(&self) -> Result<&Process> {
        let tail = self.tail.context("no chain has been built")?;
        self.processes
            .get(&tail)
            .with_context(|| format!("tail {tail} is not hosted on node {}", self.id))
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            head: self.head,
            tail: self.tail,
            delay: self.delay,
            processes: self
                .processes
                .values()
                .map(|p| ProcessStatus {
                    id: p.id,
                    successor: p.successor,
                    predecessor: p.predecessor,
                    entries: p.store.entries().to_vec(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Links all of `node`'s processes into a chain in id order.
    fn link_in_order(node: &mut Node) -> Vec<ProcessId> {
        let ids = node.process_ids();
        let assignments: Vec<LinkAssignment> = ids
            .iter()
            .enumerate()
            .map(|(i, &process)| LinkAssignment {
                process,
                predecessor: if i == 0 { None } else { Some(ids[i - 1]) },
                successor: ids.get(i + 1).copied(),
            })
            .collect();
        node.apply_links(ids[0], *ids.last().unwrap(), &assignments)
            .expect("linking local processes");
        ids
    }

    #[test]
    fn init_processes_numbers_sequentially() {
        let mut node = Node::new(3);
        let first = node.init_processes(2);
        let second = node.init_processes(1);

        assert_eq!(first, vec![ProcessId::new(3, 1), ProcessId::new(3, 2)]);
        assert_eq!(second, vec![ProcessId::new(3, 3)]);
    }

    #[test]
    fn apply_links_rejects_unknown_process() {
        let mut node = Node::new(1);
        node.init_processes(1);

        let foreign = ProcessId::new(9, 1);
        let result = node.apply_links(
            foreign,
            foreign,
            &[LinkAssignment {
                process: foreign,
                successor: None,
                predecessor: None,
            }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn apply_links_wipes_previous_data() {
        let mut node = Node::new(1);
        node.init_processes(2);
        let ids = link_in_order(&mut node);
        node.apply_write(ids[0], Book::new("dune", 9.99))
            .expect("write");

        // Rebuild with the same membership; all stores must come up empty.
        link_in_order(&mut node);
        let status = node.status();
        assert!(status.processes.iter().all(|p| p.entries.is_empty()));
    }

    #[test]
    fn mid_chain_write_forwards_to_successor_with_delay() {
        let mut node = Node::new(1);
        node.init_processes(3);
        let ids = link_in_order(&mut node);
        node.set_delay(Duration::from_millis(250));

        let hops = node
            .apply_write(ids[0], Book::new("dune", 9.99))
            .expect("write");

        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].after, Duration::from_millis(250));
        assert_eq!(hops[0].target, ids[1]);
        assert!(matches!(hops[0].request, Request::Write { process, .. } if process == ids[1]));
        assert!(!node.status().processes[0].entries[0].clean);
    }

    #[test]
    fn tail_write_marks_clean_and_acks_predecessor_undelayed() {
        let mut node = Node::new(1);
        node.init_processes(3);
        let ids = link_in_order(&mut node);
        node.set_delay(Duration::from_millis(250));

        let hops = node
            .apply_write(ids[2], Book::new("dune", 9.99))
            .expect("write at tail");

        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].after, Duration::ZERO, "tail's first clean hop is undelayed");
        assert_eq!(hops[0].target, ids[1]);
        assert!(matches!(hops[0].request, Request::Clean { .. }));

        let status = node.status();
        assert!(status.processes[2].entries[0].clean);
    }

    #[test]
    fn single_process_chain_write_settles_immediately() {
        let mut node = Node::new(1);
        node.init_processes(1);
        let ids = link_in_order(&mut node);

        let hops = node
            .apply_write(ids[0], Book::new("dune", 9.99))
            .expect("write");
        assert!(hops.is_empty());
        assert!(node.status().processes[0].entries[0].clean);
    }

    #[test]
    fn clean_applies_and_propagates_with_delay() {
        let mut node = Node::new(1);
        node.init_processes(3);
        let ids = link_in_order(&mut node);
        node.set_delay(Duration::from_millis(100));
        node.apply_write(ids[1], Book::new("dune", 9.99))
            .expect("write");

        let hops = node
            .apply_clean(ids[1], Book::new("dune", 9.99))
            .expect("clean");

        assert!(node.status().processes[1].entries[0].clean);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].after, Duration::from_millis(100));
        assert_eq!(hops[0].target, ids[0]);
    }

    #[test]
    fn stale_clean_is_discarded() {
        let mut node = Node::new(1);
        node.init_processes(2);
        let ids = link_in_order(&mut node);
        node.apply_write(ids[0], Book::new("dune", 12.50))
            .expect("newer write");

        // Acknowledgement for a superseded price: dropped, no propagation.
        let hops = node
            .apply_clean(ids[0], Book::new("dune", 9.99))
            .expect("clean");

        assert!(hops.is_empty());
        assert!(!node.status().processes[0].entries[0].clean);
    }

    #[test]
    fn clean_for_absent_name_is_discarded() {
        let mut node = Node::new(1);
        node.init_processes(2);
        let ids = link_in_order(&mut node);

        let hops = node
            .apply_clean(ids[0], Book::new("ghost", 1.0))
            .expect("clean");
        assert!(hops.is_empty());
    }

    #[test]
    fn head_clean_stops_propagation() {
        let mut node = Node::new(1);
        node.init_processes(2);
        let ids = link_in_order(&mut node);
        node.apply_write(ids[0], Book::new("dune", 9.99))
            .expect("write");

        let hops = node
            .apply_clean(ids[0], Book::new("dune", 9.99))
            .expect("clean at head");
        assert!(hops.is_empty());
    }

    #[test]
    fn read_routes_local_only_on_clean_hit() {
        let mut node = Node::new(1);
        node.init_processes(2);
        let ids = link_in_order(&mut node);
        node.apply_write(ids[0], Book::new("dune", 9.99))
            .expect("write");

        // Dirty: must defer to the tail.
        assert_eq!(node.route_read("dune"), ReadRoute::ForwardToTail(ids[1]));

        node.apply_clean(ids[0], Book::new("dune", 9.99))
            .expect("clean");
        assert_eq!(
            node.route_read("dune"),
            ReadRoute::Local(Book::new("dune", 9.99))
        );

        // Locally absent names also defer; only the tail can say not-found.
        assert_eq!(node.route_read("ghost"), ReadRoute::ForwardToTail(ids[1]));
    }

    #[test]
    fn read_without_chain_is_no_chain() {
        let node = Node::new(1);
        assert_eq!(node.route_read("dune"), ReadRoute::NoChain);
    }

    #[test]
    fn tail_read_requires_local_tail() {
        let mut node = Node::new(1);
        node.init_processes(1);
        let local = node.process_ids()[0];
        let remote_tail = ProcessId::new(2, 1);
        node.apply_links(
            local,
            remote_tail,
            &[LinkAssignment {
                process: local,
                successor: Some(remote_tail),
                predecessor: None,
            }],
        )
        .expect("link");

        assert!(node.tail_read("dune").is_err());
        assert!(node.tail_books().is_err());
    }

    #[test]
    fn tail_books_snapshots_catalog() {
        let mut node = Node::new(1);
        node.init_processes(1);
        let ids = link_in_order(&mut node);
        node.apply_write(ids[0], Book::new("dune", 9.99)).expect("write");
        node.apply_write(ids[0], Book::new("emma", 4.50)).expect("write");

        let books = node.tail_books().expect("tail is local");
        assert_eq!(
            books,
            vec![Book::new("dune", 9.99), Book::new("emma", 4.50)]
        );
        assert_eq!(node.tail_read("dune").expect("tail is local"), Some(Book::new("dune", 9.99)));
        assert_eq!(node.tail_read("ghost").expect("tail is local"), None);
    }
}
