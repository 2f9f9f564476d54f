//! Shell command parsing for the interactive node console.
//!
//! Parses operator input (like `Write-operation dune 9.99`) into structured
//! variants. Command names follow the bookstore's operator vocabulary;
//! matching is case-insensitive.

use anyhow::{anyhow, Result};

use crate::process::ProcessId;

/// Commands accepted at the node prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    /// `Local-store-ps <n>`: create n local processes.
    LocalStore { count: u32 },
    /// `Create-chain`: build a fresh global chain (destroys all stored data).
    CreateChain,
    /// `List-chain`: print the global chain order with head/tail markers.
    ListChain,
    /// `Show-processes`: dump this node's processes, links, and stores.
    ShowProcesses,
    /// `Write-operation <name> <price> [process]`: write a book, entering at
    /// the chain head unless a process id is named.
    Write {
        name: String,
        price: f64,
        process: Option<ProcessId>,
    },
    /// `Read-operation <name>`: consistency-aware read.
    Read { name: String },
    /// `List-books`: full catalog from the tail.
    ListBooks,
    /// `Set-timeout <ms>`: broadcast the propagation delay cluster-wide.
    SetTimeout { delay_ms: u64 },
    Help,
    Exit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        match (command.to_lowercase().as_str(), parts.len()) {
            ("local-store-ps", 2) => Ok(ConsoleCommand::LocalStore {
                count: parts[1]
                    .parse()
                    .map_err(|_| anyhow!("invalid process count '{}'", parts[1]))?,
            }),
            ("local-store-ps", _) => Err(anyhow!("usage: Local-store-ps <n>")),
            ("create-chain", 1) => Ok(ConsoleCommand::CreateChain),
            ("list-chain", 1) => Ok(ConsoleCommand::ListChain),
            ("show-processes", 1) => Ok(ConsoleCommand::ShowProcesses),
            ("write-operation", 3 | 4) => {
                let price: f64 = parts[2]
                    .parse()
                    .map_err(|_| anyhow!("invalid price '{}'", parts[2]))?;
                let process = match parts.get(3) {
                    Some(raw) => Some(raw.parse::<ProcessId>()?),
                    None => None,
                };
                Ok(ConsoleCommand::Write {
                    name: parts[1].to_string(),
                    price,
                    process,
                })
            }
            ("write-operation", _) => {
                Err(anyhow!("usage: Write-operation <name> <price> [process]"))
            }
            ("read-operation", 2) => Ok(ConsoleCommand::Read {
                name: parts[1].to_string(),
            }),
            ("read-operation", _) => Err(anyhow!("usage: Read-operation <name>")),
            ("list-books", 1) => Ok(ConsoleCommand::ListBooks),
            ("set-timeout", 2) => Ok(ConsoleCommand::SetTimeout {
                delay_ms: parts[1]
                    .parse()
                    .map_err(|_| anyhow!("invalid delay '{}'", parts[1]))?,
            }),
            ("set-timeout", _) => Err(anyhow!("usage: Set-timeout <ms>")),
            ("help", 1) => Ok(ConsoleCommand::Help),
            ("exit", 1) => Ok(ConsoleCommand::Exit),
            _ => Err(anyhow!("unknown command '{command}', try Help")),
        }
    }

    /// The command reference printed by `Help`.
    pub fn reference() -> &'static [&'static str] {
        &[
            "Commands (case-insensitive):",
            "  Local-store-ps <n>                    -- create n local processes",
            "  Create-chain                          -- build the global chain (wipes all data)",
            "  List-chain                            -- print the chain with Head/Tail markers",
            "  Show-processes                        -- dump local processes and stores",
            "  Write-operation <name> <price> [ps]   -- write a book (enters at the head)",
            "  Read-operation <name>                 -- read a book (clean-local or tail)",
            "  List-books                            -- full catalog from the tail",
            "  Set-timeout <ms>                      -- set cluster-wide propagation delay",
            "  Help                                  -- show this message",
            "  Exit                                  -- shut down this node",
        ]
    }
}
