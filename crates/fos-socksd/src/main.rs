//! fos-socksd: SOCKS4/4a proxy daemon
//!
//! Usage: `fos-socksd <port>`
//!
//! Listens on all interfaces at `<port>`. Remaining settings come from the
//! TOML file named by `FOS_SOCKS_CONFIG`, if set. Log verbosity follows
//! `RUST_LOG` (default `info`).

use anyhow::{Context, Result, bail};
use fos_socks::{ProxyConfig, Socks4Server};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CONFIG_ENV: &str = "FOS_SOCKS_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let port = parse_port(std::env::args().skip(1))?;
    let config = load_config(port)?;

    info!("fos-socksd starting on port {}", port);

    let server = Socks4Server::bind(config)
        .await
        .context("failed to start listener")?;
    server.run().await?;

    Ok(())
}

fn parse_port(mut args: impl Iterator<Item = String>) -> Result<u16> {
    let Some(arg) = args.next() else {
        bail!("usage: fos-socksd <port>");
    };
    if args.next().is_some() {
        bail!("usage: fos-socksd <port>");
    }
    arg.parse::<u16>()
        .with_context(|| format!("invalid port {:?}", arg))
}

/// Defaults, overlaid by the optional config file; the CLI port always wins.
fn load_config(port: u16) -> Result<ProxyConfig> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.to_string_lossy()))?,
        None => ProxyConfig::default(),
    };

    config.listen_addr = SocketAddr::new(config.listen_addr.ip(), port);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port(args(&["1080"])).unwrap(), 1080);
        assert!(parse_port(args(&[])).is_err());
        assert!(parse_port(args(&["70000"])).is_err());
        assert!(parse_port(args(&["1080", "extra"])).is_err());
    }
}
