//! Cluster-wide chain construction and inspection.
//!
//! The build runs on whichever node the operator drives, from the shell
//! thread (never the worker: the build calls back into this node's own
//! listener, and the worker must be free to serve that call). It collects
//! every process in the cluster, shuffles them into one global order, and
//! sends each node its subset of link assignments.
//!
//! Random placement is intentional: it keeps one host's processes from
//! sitting contiguously in the chain, so replication is forced across
//! hosts. There is no recovery from a node failing mid-build; the chain is
//! left undefined and must be rebuilt by hand.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use rand::seq::SliceRandom;
use tracing::info;

use crate::message::{call_with_timeout, LinkAssignment, Request, Response};
use crate::process::ProcessId;

/// How long a topology call may wait on one node before the whole operation
/// fails. Keeps an unreachable host from hanging the shell indefinitely.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a fresh global chain over every process in the cluster.
///
/// Destroys all previously stored data on every node: each `Link` handler
/// clears its local stores before applying its assignments.
pub fn build_chain(peers: &HashMap<u64, String>) -> Result<()> {
    let mut processes = Vec::new();
    for (host, addr) in sorted_peers(peers) {
        match call_with_timeout(addr, &Request::CreateChain, CALL_TIMEOUT)
            .with_context(|| format!("collecting processes from host {host}"))?
        {
            Response::Processes(ids) => processes.extend(ids),
            Response::Error(err) => bail!("host {host} failed to list processes: {err}"),
            other => bail!("unexpected response from host {host}: {other:?}"),
        }
    }
    ensure!(
        !processes.is_empty(),
        "no processes exist anywhere in the cluster; run Local-store-ps first"
    );

    processes.shuffle(&mut rand::thread_rng());

    let head = processes[0];
    let tail = *processes.last().expect("non-empty");

    // Ownership comes from the structured id, never from display strings.
    let mut per_host: HashMap<u64, Vec<LinkAssignment>> = HashMap::new();
    for (i, &process) in processes.iter().enumerate() {
        per_host.entry(process.host).or_default().push(LinkAssignment {
            process,
            predecessor: (i > 0).then(|| processes[i - 1]),
            successor: processes.get(i + 1).copied(),
        });
    }

    for (host, addr) in sorted_peers(peers) {
        let assignments = per_host.remove(host).unwrap_or_default();
        match call_with_timeout(
            addr,
            &Request::Link {
                head,
                tail,
                assignments,
            },
            CALL_TIMEOUT,
        )
        .with_context(|| format!("sending link assignments to host {host}"))?
        {
            Response::Linked => {}
            Response::Error(err) => bail!("host {host} rejected link assignments: {err}"),
            other => bail!("unexpected response from host {host}: {other:?}"),
        }
    }

    info!(len = processes.len(), head = %head, tail = %tail, "chain built");
    Ok(())
}

/// Reconstructs the global chain order by gathering every node's local link
/// state and walking successor links from the head.
pub fn list_chain(peers: &HashMap<u64, String>) -> Result<Vec<ProcessId>> {
    let mut links = Vec::new();
    for (host, addr) in sorted_peers(peers) {
        match call_with_timeout(addr, &Request::ListChain, CALL_TIMEOUT)
            .with_context(|| format!("listing chain links on host {host}"))?
        {
            Response::Links(local) => links.extend(local),
            Response::Error(err) => bail!("host {host} failed to list links: {err}"),
            other => bail!("unexpected response from host {host}: {other:?}"),
        }
    }
    order_from_links(&links)
}

/// Broadcasts the cluster-wide propagation delay to every node.
pub fn set_timeout(peers: &HashMap<u64, String>, delay: Duration) -> Result<()> {
    let delay_ms = delay.as_millis() as u64;
    for (host, addr) in sorted_peers(peers) {
        match call_with_timeout(addr, &Request::SetTimeout { delay_ms }, CALL_TIMEOUT)
            .with_context(|| format!("setting timeout on host {host}"))?
        {
            Response::Ack => {}
            Response::Error(err) => bail!("host {host} rejected timeout: {err}"),
            other => bail!("unexpected response from host {host}: {other:?}"),
        }
    }
    Ok(())
}

/// Orders link records into the global chain: exactly one process has no
/// predecessor, and following successors from it must visit every process
/// exactly once.
pub fn order_from_links(links: &[LinkAssignment]) -> Result<Vec<ProcessId>> {
    ensure!(!links.is_empty(), "no chain has been built");

    let by_id: HashMap<ProcessId, &LinkAssignment> =
        links.iter().map(|link| (link.process, link)).collect();
    ensure!(
        by_id.len() == links.len(),
        "duplicate process ids in chain links"
    );

    let mut heads = links.iter().filter(|link| link.predecessor.is_none());
    let head = heads.next().context("chain has no head")?;
    ensure!(heads.next().is_none(), "chain has more than one head");

    let mut order = Vec::with_capacity(links.len());
    let mut current = Some(head.process);
    while let Some(id) = current {
        if order.len() == links.len() {
            bail!("chain contains a cycle");
        }
        let link = by_id
            .get(&id)
            .ok_or_else(|| anyhow!("chain references unknown process {id}"))?;
        order.push(id);
        current = link.successor;
    }
    ensure!(
        order.len() == links.len(),
        "chain walk visited {} of {} processes; chain is broken",
        order.len(),
        links.len()
    );
    Ok(order)
}

/// Renders a chain order the way the shell prints it:
/// `Node1-ps2(Head) -> Node2-ps1 -> Node1-ps1(Tail)`.
pub fn format_chain(order: &[ProcessId]) -> String {
    let last = order.len().saturating_sub(1);
    order
        .iter()
        .enumerate()
        .map(|(i, id)| {
            if order.len() == 1 {
                format!("{id}(Head)(Tail)")
            } else if i == 0 {
                format!("{id}(Head)")
            } else if i == last {
                format!("{id}(Tail)")
            } else {
                id.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn sorted_peers(peers: &HashMap<u64, String>) -> Vec<(&u64, &String)> {
    let mut entries: Vec<_> = peers.iter().collect();
    entries.sort_by_key(|(host, _)| **host);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(
        process: (u64, u32),
        predecessor: Option<(u64, u32)>,
        successor: Option<(u64, u32)>,
    ) -> LinkAssignment {
        LinkAssignment {
            process: ProcessId::new(process.0, process.1),
            predecessor: predecessor.map(|(h, s)| ProcessId::new(h, s)),
            successor: successor.map(|(h, s)| ProcessId::new(h, s)),
        }
    }

    #[test]
    fn orders_links_from_head_to_tail() {
        // Records arrive grouped by host, not in chain order.
        let links = vec![
            link((1, 1), Some((2, 1)), None),
            link((1, 2), None, Some((2, 1))),
            link((2, 1), Some((1, 2)), Some((1, 1))),
        ];

        let order = order_from_links(&links).expect("valid chain");
        assert_eq!(
            order,
            vec![
                ProcessId::new(1, 2),
                ProcessId::new(2, 1),
                ProcessId::new(1, 1),
            ]
        );
    }

    #[test]
    fn rejects_chain_without_head() {
        let links = vec![
            link((1, 1), Some((1, 2)), Some((1, 2))),
            link((1, 2), Some((1, 1)), Some((1, 1))),
        ];
        assert!(order_from_links(&links).is_err());
    }

    #[test]
    fn rejects_two_heads() {
        let links = vec![
            link((1, 1), None, None),
            link((1, 2), None, None),
        ];
        assert!(order_from_links(&links).is_err());
    }

    #[test]
    fn rejects_broken_successor_link() {
        let links = vec![
            link((1, 1), None, Some((9, 9))),
            link((1, 2), Some((1, 1)), None),
        ];
        assert!(order_from_links(&links).is_err());
    }

    #[test]
    fn rejects_empty_links() {
        assert!(order_from_links(&[]).is_err());
    }

    #[test]
    fn single_process_chain_is_valid() {
        let links = vec![link((1, 1), None, None)];
        let order = order_from_links(&links).expect("valid chain");
        assert_eq!(order, vec![ProcessId::new(1, 1)]);
        assert_eq!(format_chain(&order), "Node1-ps1(Head)(Tail)");
    }

    #[test]
    fn formats_head_and_tail_markers() {
        let order = vec![
            ProcessId::new(1, 2),
            ProcessId::new(2, 1),
            ProcessId::new(1, 1),
        ];
        assert_eq!(
            format_chain(&order),
            "Node1-ps2(Head) -> Node2-ps1 -> Node1-ps1(Tail)"
        );
    }
}
