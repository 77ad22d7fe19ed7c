//! wasmhost: run WASM contracts against an in-memory chain.
//!
//! ## Example Usage
//!
//! ```bash
//! # Run a full request, persisting state between runs
//! wasmhost run counter.wasm increment --state counter.json
//!
//! # Read it back with a view call
//! wasmhost run counter.wasm getCounter --view --state counter.json --json
//!
//! # Pass parameters (text, or hex with a 0x prefix)
//! wasmhost run token.wasm transfer --param to=alice --param amount=0x0a00000000000000
//!
//! # Inspect the ABI tables
//! wasmhost keys
//! wasmhost functions
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use wasmhost_core::dispatch;
use wasmhost_core::HostConfig;
use wasmhost_types::keys::predefined_keys;

use wasp_wasmhost::logging::{init_logging, LogFormat};
use wasp_wasmhost::runner::{self, parse_param, RunRequest};

#[derive(Parser)]
#[command(
    name = "wasmhost",
    author,
    version,
    about = "Run WASM smart contracts in a local sandbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a contract and run one of its exported functions
    Run(RunCmd),

    /// Print the predefined key table
    Keys,

    /// Print the sandbox function table
    Functions,
}

#[derive(Parser, Debug)]
struct RunCmd {
    /// Contract module (.wasm binary or .wat text)
    wasm: PathBuf,

    /// Exported function to call
    function: String,

    /// Run as a read-only view call
    #[arg(long)]
    view: bool,

    /// JSON state file, loaded before the call and written back after full calls
    #[arg(long)]
    state: Option<PathBuf>,

    /// Call parameter as key=value (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, Vec<u8>)>,

    /// Host configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,
}

impl RunCmd {
    fn execute(self, json_output: bool) -> Result<()> {
        let config = match &self.config {
            Some(path) => HostConfig::from_file(path)?,
            None => HostConfig::default(),
        };
        let outcome = runner::run(&RunRequest {
            wasm: self.wasm,
            function: self.function,
            view: self.view,
            state_file: self.state,
            params: self.params,
            config,
        })?;
        if json_output {
            println!("{}", outcome.to_json()?);
        } else {
            print!("{}", outcome.to_text());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct TableRow {
    id: i32,
    name: &'static str,
}

fn print_table(rows: Vec<TableRow>, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in rows {
            println!("{:>4}  {}", row.id, row.name);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let Cli {
        command,
        json,
        log_json,
    } = Cli::parse();
    init_logging(LogFormat::from_flag(log_json));

    match command {
        Commands::Run(cmd) => cmd.execute(json),
        Commands::Keys => print_table(
            predefined_keys()
                .map(|(id, name)| TableRow { id, name })
                .collect(),
            json,
        ),
        Commands::Functions => print_table(
            dispatch::functions()
                .map(|(id, name)| TableRow { id, name })
                .collect(),
            json,
        ),
    }
}
