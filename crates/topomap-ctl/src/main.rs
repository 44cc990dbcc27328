//! topomap-ctl — command-line interface for the topomap daemon.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 8000;

fn print_usage() {
    println!("Usage: topomap-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status        Show neighbour and node counts");
    println!("  neighbours    List directly adjacent protocol speakers");
    println!("  nodes         Show the published node list with peers");
    println!("  watch         Print every topology update as it is published");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["neighbours"] => cmd::topology::cmd_neighbours(port).await,
        ["nodes"] => cmd::topology::cmd_nodes(port).await,
        ["watch"] => cmd::topology::cmd_watch(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
