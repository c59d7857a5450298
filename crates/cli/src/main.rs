//! MinFS command line entry point.
//!
//! ```text
//! minfs https://play.min.io:9000/mybucket /mnt/mybucket -o uid=1000,gid=1000,cache=/tmp/minfs
//! ```
//!
//! Note that empty directories exist only in the local index until a
//! file is written below them; other clients see them appear once an
//! object lands under their prefix.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use minfs_vfs::{AccessConfig, MountConfig};

/// Fuse driver for an S3-compatible object storage server.
#[derive(Debug, Parser)]
#[command(name = "minfs", version, about)]
struct Cli {
    /// Storage target: http[s]://host[:port]/bucket[/prefix]
    target: String,

    /// Directory to mount the bucket at.
    mountpoint: PathBuf,

    /// Comma-separated mount options:
    /// uid=<n>,gid=<n>,cache=<path>,insecure,debug
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Option<String>,
}

/// Apply the `-o` option string to the mount config.
fn apply_options(config: &mut MountConfig, options: &str) -> Result<(), String> {
    for token in options.split(',').filter(|t| !t.is_empty()) {
        let (key, value): (&str, Option<&str>) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };
        match key {
            "uid" => {
                let raw: &str = value.ok_or("uid has no value")?;
                config.uid = raw
                    .parse()
                    .map_err(|_| format!("uid is not a valid value: {}", raw))?;
            }
            "gid" => {
                let raw: &str = value.ok_or("gid has no value")?;
                config.gid = raw
                    .parse()
                    .map_err(|_| format!("gid is not a valid value: {}", raw))?;
            }
            "cache" => {
                let raw: &str = value.ok_or("cache has no value")?;
                config.cache_dir = PathBuf::from(raw);
            }
            "insecure" => config.insecure = true,
            "debug" => config.debug = true,
            other => return Err(format!("unknown mount option: {}", other)),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli: Cli = Cli::parse();

    let mut config: MountConfig = match MountConfig::new(&cli.target, &cli.mountpoint) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("minfs: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Some(options) = cli.options.as_deref() {
        if let Err(err) = apply_options(&mut config, options) {
            eprintln!("minfs: {}", err);
            return ExitCode::FAILURE;
        }
    }

    let filter: &str = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    // Credentials: config.json in the cache dir, overridden by
    // MINFS_ACCESS_KEY / MINFS_SECRET_KEY / MINFS_SECRET_TOKEN.
    let access: AccessConfig = match AccessConfig::load_or_init(&config.cache_dir) {
        Ok(a) => a,
        Err(err) => {
            eprintln!("minfs: unable to initialize config: {}", err);
            return ExitCode::FAILURE;
        }
    };
    config.access_key = access.access_key;
    config.secret_key = access.secret_key;
    config.secret_token = if access.secret_token.is_empty() {
        None
    } else {
        Some(access.secret_token)
    };

    match minfs_vfs::serve(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("minfs: {}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn base_config() -> MountConfig {
        MountConfig::new("http://localhost:9000/bucket", Path::new("/mnt/b")).unwrap()
    }

    #[test]
    fn test_apply_options_full() {
        let mut config = base_config();
        apply_options(&mut config, "uid=1000,gid=1001,cache=/tmp/x,insecure,debug").unwrap();

        assert_eq!(config.uid, 1000);
        assert_eq!(config.gid, 1001);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/x"));
        assert!(config.insecure);
        assert!(config.debug);
    }

    #[test]
    fn test_apply_options_rejects_missing_value() {
        let mut config = base_config();
        assert!(apply_options(&mut config, "uid").is_err());
        assert!(apply_options(&mut config, "uid=notanumber").is_err());
    }

    #[test]
    fn test_apply_options_rejects_unknown_token() {
        let mut config = base_config();
        assert!(apply_options(&mut config, "frobnicate").is_err());
    }

    #[test]
    fn test_apply_options_empty_is_noop() {
        let mut config = base_config();
        apply_options(&mut config, "").unwrap();
        assert_eq!(config.uid, 0);
    }
}
