//! lansync - keep one directory in sync with peers on the local network
//!
//! Starts a peer on the configured port, runs the resident loop in the
//! background and reads console commands from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use lansync::action::ActionHandler;
use lansync::cli::PeerOpts;
use lansync::console::{Console, HELP};
use lansync::logger::{ConsoleLogger, Logger, TextLogger};
use lansync::peer::Peer;
use lansync::resident::Resident;
use lansync::sync_dir::SynchronizedDirectory;

fn main() -> Result<()> {
    let opts = PeerOpts::parse();
    let config = opts.resolve()?;

    // Choose logger once; the console keeps stdout for command output
    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("open log file {}", p.display()))?,
        ),
        None => Arc::new(ConsoleLogger),
    };

    let directory = SynchronizedDirectory::open(&config.root)
        .with_context(|| format!("open synchronized directory {}", config.root.display()))?;
    let peer = Arc::new(
        Peer::new(&config, Arc::clone(&logger))
            .with_context(|| format!("start peer on port {}", config.port))?,
    );
    let handler = Arc::new(ActionHandler::new(Arc::new(directory), Arc::clone(&logger)));

    {
        let peer = Arc::clone(&peer);
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted by user. Shutting down...");
            peer.close();
            // stdin stays blocked in read_line; leave like the console would
            std::process::exit(130);
        })
        .context("install Ctrl-C handler")?;
    }

    let resident = Resident::new(Arc::clone(&peer), Arc::clone(&handler), Arc::clone(&logger))
        .spawn()
        .context("spawn resident loop")?;

    println!(
        "lansync on port {} syncing {}",
        peer.port(),
        handler.directory().path().display()
    );
    println!("{HELP}");

    let mut console = Console::new(Arc::clone(&peer), handler);
    let stdin = std::io::stdin();
    let result = console.run(stdin.lock(), std::io::stdout());

    peer.close();
    let _ = resident.join();
    result
}
