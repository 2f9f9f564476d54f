//! CLI entry point for running a bookstore node with an interactive shell.
//!
//! # Example usage
//!
//! Start a 2-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- \
//!   --id 2 --listen 127.0.0.1:7102 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102
//! ```
//!
//! Then, at any prompt:
//! ```text
//! Node-1> Local-store-ps 2        (on every node)
//! Node-1> Create-chain
//! Node-1> Write-operation dune 9.99
//! Node-1> Read-operation dune
//! ```

use std::collections::HashMap;
use std::io::{self, BufRead, Write as _};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};

use chain_replication::protocol::ConsoleCommand;
use chain_replication::runtime::{spawn_node, NodeConfig, NodeHandle};
use chain_replication::store::Book;
use chain_replication::topology;

/// Command-line arguments for a bookstore node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a chain-replication bookstore node")]
struct Args {
    /// Numeric host id (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address this node should listen on, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;

    if peers.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        return Err(anyhow::anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }

    let handle = spawn_node(NodeConfig {
        id: args.id,
        listen_addr: args.listen.clone(),
        peers: peers.clone(),
    })?;

    println!("Node {} ready. Type Help for commands.", args.id);
    run_shell(args.id, &handle, &peers)?;
    handle.shutdown()?;
    Ok(())
}

/// Line-oriented REPL: one command per line at a per-node prompt.
fn run_shell(node_id: u64, handle: &NodeHandle, peers: &HashMap<u64, String>) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("Node-{node_id}> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            return Ok(()); // stdin closed
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("ERROR: {err}");
                continue;
            }
        };

        match command {
            ConsoleCommand::Exit => return Ok(()),
            other => {
                if let Err(err) = dispatch(other, handle, peers, &mut lines) {
                    println!("ERROR: {err:#}");
                }
            }
        }
    }
}

fn dispatch(
    command: ConsoleCommand,
    handle: &NodeHandle,
    peers: &HashMap<u64, String>,
    lines: &mut impl Iterator<Item = io::Result<String>>,
) -> Result<()> {
    match command {
        ConsoleCommand::LocalStore { count } => {
            let created = handle.init_processes(count)?;
            for id in created {
                println!("created {id}");
            }
        }
        ConsoleCommand::CreateChain => {
            // Rebuilding destroys every store in the cluster; make the
            // operator say so explicitly when a chain already exists.
            if handle.status()?.head.is_some() && !confirm_rebuild(lines)? {
                println!("aborted");
                return Ok(());
            }
            topology::build_chain(peers)?;
            println!("{}", topology::format_chain(&topology::list_chain(peers)?));
        }
        ConsoleCommand::ListChain => {
            if handle.status()?.head.is_none() {
                println!("no chain has been built");
                return Ok(());
            }
            println!("{}", topology::format_chain(&topology::list_chain(peers)?));
        }
        ConsoleCommand::ShowProcesses => {
            let status = handle.status()?;
            if status.processes.is_empty() {
                println!("no local processes; run Local-store-ps <n>");
            }
            for process in status.processes {
                let successor = process
                    .successor
                    .map_or_else(|| "None".to_string(), |id| id.to_string());
                println!("{} -> {successor}", process.id);
                for entry in process.entries {
                    let state = if entry.clean { "clean" } else { "dirty" };
                    println!("  {} = {} ({state})", entry.book.name, entry.book.price);
                }
            }
        }
        ConsoleCommand::Write {
            name,
            price,
            process,
        } => {
            handle.write(process, Book::new(name.clone(), price))?;
            println!("OK: {name} = {price}");
        }
        ConsoleCommand::Read { name } => match handle.read(name.clone())? {
            Some(book) => println!("{} = {}", book.name, book.price),
            None => println!("{name} not found"),
        },
        ConsoleCommand::ListBooks => {
            let books = handle.list_books()?;
            if books.is_empty() {
                println!("no books in the store");
            }
            for (i, book) in books.iter().enumerate() {
                println!("{}) {} = {}", i + 1, book.name, book.price);
            }
        }
        ConsoleCommand::SetTimeout { delay_ms } => {
            topology::set_timeout(peers, Duration::from_millis(delay_ms))?;
            println!("propagation delay set to {delay_ms}ms cluster-wide");
        }
        ConsoleCommand::Help => {
            for line in ConsoleCommand::reference() {
                println!("{line}");
            }
        }
        ConsoleCommand::Exit => unreachable!("handled by the shell loop"),
    }
    Ok(())
}

fn confirm_rebuild(lines: &mut impl Iterator<Item = io::Result<String>>) -> Result<bool> {
    print!(
        "A chain already exists. Creating a new chain destroys all stored data. \
         Continue? yes/no: "
    );
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(line?.trim().eq_ignore_ascii_case("yes")),
        None => Ok(false),
    }
}

/// Parses peer entries from the command line into a host-address map.
fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid peer entry '{entry}', expected id=addr"
            ));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.to_string());
    }
    if peers.is_empty() {
        return Err(anyhow::anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}
