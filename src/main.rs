use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use stratafs::{mount_union, parse_mount_options, MountConfig};

/// Mount a stack of branch directories as one union filesystem.
#[derive(Parser, Debug)]
#[command(name = "stratafs", version, about)]
struct Args {
    /// Where to mount the union.
    mountpoint: PathBuf,

    /// Mount options; `dirs=<dir>[=ro|=rw][:<dir>...]` is required and the
    /// leftmost branch must be writable.
    #[arg(short = 'o', long = "options", value_name = "OPTS")]
    options: String,

    /// Let other users access the mount (needs user_allow_other in
    /// /etc/fuse.conf).
    #[arg(long)]
    allow_other: bool,

    /// Attribute cache TTL in seconds.
    #[arg(long, default_value_t = 1)]
    ttl: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("STRATAFS_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .init();

    let args = Args::parse();

    let specs = match parse_mount_options(&args.options) {
        Ok(specs) => specs,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = MountConfig {
        allow_other: args.allow_other,
        auto_unmount: true,
        ttl_secs: args.ttl,
    };

    match mount_union(&args.mountpoint, specs, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
