//! Worker runtime and network handling for chain nodes.
//!
//! Threading model:
//!
//! - **Worker thread**: owns the [`Node`] and applies every operation, so
//!   each store has a single writer and needs no locks. The worker never
//!   blocks on the network: it answers from local state or tells the caller
//!   where to forward.
//! - **Listener thread**: accepts TCP connections from peers.
//! - **Connection handler threads**: short-lived, one per connection; they
//!   read framed requests, forward them to the worker over a channel, and
//!   write back the response.
//! - **Hop threads**: one detached thread per scheduled propagation step.
//!   Each sleeps for its delay, then issues one blocking remote call to the
//!   next process's owner. `Write` and `Clean` handlers return to their
//!   caller immediately after scheduling, never after the chain settles.
//!
//! Remote forwarding of client reads and writes happens on the shell thread
//! inside [`NodeHandle`], keeping the worker free to serve inbound calls
//! (including calls this node makes to itself during topology builds).
//!
//! There is no cancellation: a chain rebuild while hops are in flight leaves
//! them targeting stale links, and the receiving node discards what no
//! longer applies.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::message::{call, read_frame, write_frame, Request, Response};
use crate::node::{Hop, Node, NodeStatus, ReadRoute};
use crate::process::ProcessId;
use crate::store::Book;

/// Configuration for spawning a chain node.
///
/// `peers` is the cluster-wide host-address table, injected explicitly; it
/// must be identical on every node and include this node's own entry.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This host's id (must appear in `peers`).
    pub id: u64,
    /// Address to bind for incoming calls, e.g. "127.0.0.1:7101".
    pub listen_addr: String,
    /// Map of host id to network address for every node, including self.
    pub peers: HashMap<u64, String>,
}

/// Handle for driving a running node from the shell or tests.
///
/// The worker thread owns the actual [`Node`]; this handle talks to it over
/// a channel, one request/response pair per operation, and performs any
/// forwarding to remote nodes itself.
#[derive(Clone)]
pub struct NodeHandle {
    request_tx: Sender<ClientRequest>,
    peers: HashMap<u64, String>,
}

impl NodeHandle {
    /// Creates `n` fresh processes on this node. Local-only; the chain is
    /// unaffected until the next build.
    pub fn init_processes(&self, n: u32) -> Result<Vec<ProcessId>> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::InitProcesses { n, respond_to: resp_tx })
            .context("failed to send init request")?;
        resp_rx.recv().context("init response channel closed")
    }

    /// Submits a write. With `process = None` the write goes to the current
    /// chain head; when the target lives on another host, the write is
    /// forwarded there. Returns once the entry hop is applied and the next
    /// one is scheduled, not once the chain settles.
    pub fn write(&self, process: Option<ProcessId>, book: Book) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::ApplyWrite {
                process,
                book: book.clone(),
                respond_to: resp_tx,
            })
            .context("failed to send write request")?;
        match resp_rx.recv().context("write response channel closed")?? {
            WriteDecision::Applied => Ok(()),
            WriteDecision::Forward(target) => {
                let addr = self.peer_addr(target.host)?;
                match call(addr, &Request::Write { process: target, book })? {
                    Response::Ack => Ok(()),
                    Response::Error(err) => Err(anyhow!("write rejected by {addr}: {err}")),
                    other => Err(anyhow!("unexpected write response from {addr}: {other:?}")),
                }
            }
        }
    }

    /// Consistency-aware read: answered locally only from a clean entry in
    /// this node's first process, otherwise deferred to the tail (without a
    /// network hop when this node owns the tail).
    pub fn read(&self, name: String) -> Result<Option<Book>> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::RouteRead {
                name: name.clone(),
                respond_to: resp_tx,
            })
            .context("failed to send read request")?;
        match resp_rx.recv().context("read response channel closed")?? {
            ReadDecision::Value(book) => Ok(book),
            ReadDecision::Forward(tail) => {
                let addr = self.peer_addr(tail.host)?;
                match call(addr, &Request::Read { name })? {
                    Response::Book(book) => Ok(book),
                    Response::Error(err) => Err(anyhow!("read rejected by {addr}: {err}")),
                    other => Err(anyhow!("unexpected read response from {addr}: {other:?}")),
                }
            }
        }
    }

    /// Full catalog, always taken from the tail. Scattered clean entries on
    /// other replicas cannot be assembled into a consistent snapshot.
    pub fn list_books(&self) -> Result<Vec<Book>> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::RouteListBooks { respond_to: resp_tx })
            .context("failed to send list-books request")?;
        match resp_rx
            .recv()
            .context("list-books response channel closed")??
        {
            ListDecision::Books(books) => Ok(books),
            ListDecision::Forward(tail) => {
                let addr = self.peer_addr(tail.host)?;
                match call(addr, &Request::ListBooks)? {
                    Response::Books(books) => Ok(books),
                    Response::Error(err) => Err(anyhow!("list-books rejected by {addr}: {err}")),
                    other => {
                        Err(anyhow!("unexpected list-books response from {addr}: {other:?}"))
                    }
                }
            }
        }
    }

    /// Snapshot of this node's processes, links, and store contents.
    pub fn status(&self) -> Result<NodeStatus> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Status { respond_to: resp_tx })
            .context("failed to send status request")?;
        resp_rx.recv().context("status response channel closed")
    }

    /// Signals the worker to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(ClientRequest::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }

    fn peer_addr(&self, host: u64) -> Result<&str> {
        self.peers
            .get(&host)
            .map(String::as_str)
            .with_context(|| format!("no address known for host {host}"))
    }
}

/// Where the worker decided a client write lands.
enum WriteDecision {
    /// The target process is local; the write was applied and the next hop
    /// scheduled.
    Applied,
    /// The target process lives on another host; the caller forwards.
    Forward(ProcessId),
}

/// How the worker decided a client read is answered.
enum ReadDecision {
    /// Answered from local state: a clean local hit, or this node owns the
    /// tail.
    Value(Option<Book>),
    /// Dirty or absent locally and the tail is remote; the caller forwards.
    Forward(ProcessId),
}

enum ListDecision {
    Books(Vec<Book>),
    Forward(ProcessId),
}

/// Requests from the shell/test thread to the worker.
enum ClientRequest {
    InitProcesses {
        n: u32,
        respond_to: Sender<Vec<ProcessId>>,
    },
    ApplyWrite {
        process: Option<ProcessId>,
        book: Book,
        respond_to: Sender<Result<WriteDecision>>,
    },
    RouteRead {
        name: String,
        respond_to: Sender<Result<ReadDecision>>,
    },
    RouteListBooks {
        respond_to: Sender<Result<ListDecision>>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Shutdown,
}

/// A framed request from a peer, paired with the channel the connection
/// handler is blocked on.
struct PeerRequest {
    request: Request,
    respond_to: Sender<Response>,
}

/// Spawns a chain node: binds the listener, starts the worker, and returns
/// a handle for local operations.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    if !config.peers.contains_key(&config.id) {
        return Err(anyhow!("node id {} missing from peers map", config.id));
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(node = config.id, addr = %config.listen_addr, "node listening");

    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();

    spawn_listener(listener, network_tx)?;

    let node = Node::new(config.id);
    let peers = config.peers.clone();
    thread::Builder::new()
        .name(format!("chain-worker-{}", node.id()))
        .spawn(move || {
            Worker::new(node, peers, client_rx, network_rx).run();
        })
        .context("failed to spawn chain worker")?;

    Ok(NodeHandle {
        request_tx: client_tx,
        peers: config.peers,
    })
}

/// The worker that owns all node state and applies every operation.
struct Worker {
    node: Node,
    peers: HashMap<u64, String>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<PeerRequest>,
}

impl Worker {
    fn new(
        node: Node,
        peers: HashMap<u64, String>,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<PeerRequest>,
    ) -> Self {
        Self {
            node,
            peers,
            client_rx,
            network_rx,
        }
    }

    fn run(&mut self) {
        loop {
            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req) {
                                break;
                            }
                        }
                        Err(_) => break, // handle dropped
                    }
                }
                recv(self.network_rx) -> req => {
                    match req {
                        Ok(req) => {
                            let response = self.handle_peer_request(req.request);
                            let _ = req.respond_to.send(response);
                        }
                        Err(_) => break, // listener died
                    }
                }
            }
        }
        debug!(node = self.node.id(), "worker stopped");
    }

    /// Returns `false` once shutdown is requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> bool {
        match req {
            ClientRequest::InitProcesses { n, respond_to } => {
                let created = self.node.init_processes(n);
                info!(node = self.node.id(), count = n, "created local processes");
                let _ = respond_to.send(created);
            }
            ClientRequest::ApplyWrite {
                process,
                book,
                respond_to,
            } => {
                let _ = respond_to.send(self.decide_write(process, book));
            }
            ClientRequest::RouteRead { name, respond_to } => {
                let _ = respond_to.send(self.decide_read(&name));
            }
            ClientRequest::RouteListBooks { respond_to } => {
                let _ = respond_to.send(self.decide_list_books());
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(self.node.status());
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    /// Applies a client write when the target process is local, otherwise
    /// names the process the caller must forward to. The target defaults to
    /// the global head.
    fn decide_write(&mut self, process: Option<ProcessId>, book: Book) -> Result<WriteDecision> {
        let target = process
            .or_else(|| self.node.head())
            .context("no chain has been built; cannot write")?;

        if target.host != self.node.id() {
            return Ok(WriteDecision::Forward(target));
        }
        let hops = self.node.apply_write(target, book)?;
        self.schedule_hops(hops);
        Ok(WriteDecision::Applied)
    }

    /// The consistency-aware read path. Only a clean local hit skips the
    /// tail; the tail itself is answered locally when this node owns it.
    fn decide_read(&mut self, name: &str) -> Result<ReadDecision> {
        match self.node.route_read(name) {
            ReadRoute::Local(book) => Ok(ReadDecision::Value(Some(book))),
            ReadRoute::NoChain => Err(anyhow!("no chain has been built; cannot read")),
            ReadRoute::ForwardToTail(tail) => {
                if tail.host == self.node.id() {
                    Ok(ReadDecision::Value(self.node.tail_read(name)?))
                } else {
                    Ok(ReadDecision::Forward(tail))
                }
            }
        }
    }

    fn decide_list_books(&mut self) -> Result<ListDecision> {
        let tail = self
            .node
            .tail()
            .context("no chain has been built; cannot list books")?;
        if tail.host == self.node.id() {
            Ok(ListDecision::Books(self.node.tail_books()?))
        } else {
            Ok(ListDecision::Forward(tail))
        }
    }

    fn handle_peer_request(&mut self, request: Request) -> Response {
        match request {
            Request::CreateChain => Response::Processes(self.node.process_ids()),
            Request::Link {
                head,
                tail,
                assignments,
            } => match self.node.apply_links(head, tail, &assignments) {
                Ok(()) => {
                    info!(
                        node = self.node.id(),
                        head = %head,
                        tail = %tail,
                        "chain links applied"
                    );
                    Response::Linked
                }
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Request::ListChain => Response::Links(self.node.chain_links()),
            Request::ListBooks => match self.node.tail_books() {
                Ok(books) => Response::Books(books),
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Request::Read { name } => match self.node.tail_read(&name) {
                Ok(book) => Response::Book(book),
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Request::Write { process, book } => match self.node.apply_write(process, book) {
                Ok(hops) => {
                    self.schedule_hops(hops);
                    Response::Ack
                }
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Request::Clean { process, book } => match self.node.apply_clean(process, book) {
                Ok(hops) => {
                    self.schedule_hops(hops);
                    Response::Ack
                }
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Request::SetTimeout { delay_ms } => {
                self.node.set_delay(Duration::from_millis(delay_ms));
                info!(node = self.node.id(), delay_ms, "propagation delay set");
                Response::Ack
            }
        }
    }

    /// Spawns one detached timer thread per hop. Delivery failures are
    /// logged and dropped; the protocol has no retries.
    fn schedule_hops(&self, hops: Vec<Hop>) {
        for hop in hops {
            let Some(addr) = self.peers.get(&hop.target.host) else {
                warn!(target = %hop.target, "no address for hop target, dropping");
                continue;
            };
            let addr = addr.clone();
            let node_id = self.node.id();
            thread::spawn(move || {
                if !hop.after.is_zero() {
                    thread::sleep(hop.after);
                }
                match call(&addr, &hop.request) {
                    Ok(Response::Ack) => {}
                    Ok(Response::Error(err)) => {
                        warn!(node = node_id, target = %hop.target, %err, "hop rejected");
                    }
                    Ok(other) => {
                        warn!(
                            node = node_id,
                            target = %hop.target,
                            ?other,
                            "unexpected hop response"
                        );
                    }
                    Err(err) => {
                        warn!(
                            node = node_id,
                            target = %hop.target,
                            err = %format!("{err:#}"),
                            "hop delivery failed"
                        );
                    }
                }
            });
        }
    }
}

/// Accept loop: one short-lived handler thread per connection.
fn spawn_listener(listener: TcpListener, tx: Sender<PeerRequest>) -> Result<()> {
    let addr = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("chain-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                warn!(err = %format!("{err:#}"), "connection error");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn listener")
}

/// Serves one peer connection: read a framed request, hand it to the worker,
/// write back the framed response, until the peer closes.
fn handle_connection(mut stream: TcpStream, tx: Sender<PeerRequest>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, Request>(&mut stream)? {
        let (resp_tx, resp_rx) = unbounded();
        if tx
            .send(PeerRequest {
                request,
                respond_to: resp_tx,
            })
            .is_err()
        {
            break; // worker gone
        }
        let Ok(response) = resp_rx.recv() else {
            break;
        };
        write_frame(&mut stream, &response)?;
    }
    Ok(())
}
