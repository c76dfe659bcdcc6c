//! # Bitpipe
//!
//! A command-line BitTorrent client downloading single-file torrents.
//!
//! ## Usage
//!
//! ```bash
//! bitpipe <torrent_file>
//! bitpipe <torrent_file> -o <output_file> --stall-timeout 120
//! ```
//!
//! Set `RUST_LOG=info` (or `debug`) to follow connections and pieces.

#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bitpipe::torrent::{generate_peer_id, PORT};
use bitpipe::{Config, Torrent};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Port announced to the tracker
    #[arg(short = 'p', long, default_value_t = PORT)]
    port: u16,

    /// Give up when no piece completes for this many seconds
    #[arg(long, value_name = "SECS")]
    stall_timeout: Option<u64>,

    /// Overwrite the output file without asking
    #[arg(short = 'y', long)]
    yes: bool,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Output file '{}' already exists.", path.display());
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    Ok(input == "y" || input == "yes")
}

fn run(args: Args) -> Result<()> {
    if !args.torrent.exists() {
        return Err(anyhow!(
            "could not find torrent file: {}",
            args.torrent.display()
        ));
    }

    let torrent = Torrent::open(&args.torrent)?;

    let output_filepath = args
        .output
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    if output_filepath.exists() && !args.yes && !confirm_overwrite(&output_filepath)? {
        println!("Download cancelled.");
        return Ok(());
    }

    let peer_id = generate_peer_id();
    let peers = torrent.request_peers(&peer_id, args.port)?;
    info!("Found {} peers", peers.len());

    let config = Config {
        stall_timeout: args.stall_timeout.map(Duration::from_secs),
        show_progress: true,
        ..Config::default()
    };
    let data = torrent.download(peer_id, peers, config)?;

    let mut output_file = File::create(&output_filepath).with_context(|| {
        format!(
            "could not create output file '{}'",
            output_filepath.display()
        )
    })?;
    output_file.write_all(&data).with_context(|| {
        format!(
            "could not write data to file '{}'",
            output_filepath.display()
        )
    })?;

    println!("Saved in \"{}\".", output_filepath.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        error!("{:#}", error);
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("debian.iso"), "debian.iso");
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("  "), "download");
        assert_eq!(sanitize_filename(".."), "download");
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from(["bitpipe", "file.torrent", "-o", "out.bin", "--stall-timeout", "60", "-y"]);

        assert_eq!(args.torrent, PathBuf::from("file.torrent"));
        assert_eq!(args.output, Some(PathBuf::from("out.bin")));
        assert_eq!(args.port, PORT);
        assert_eq!(args.stall_timeout, Some(60));
        assert!(args.yes);
    }
}
