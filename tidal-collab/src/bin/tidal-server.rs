//! Reference wave server.
//!
//! ```text
//! RUST_LOG=info tidal-server --bind 0.0.0.0:9090 --policy reject-stale
//! ```

use clap::{Arg, ArgMatches, Command};
use tidal_collab::container::SubmitPolicy;
use tidal_collab::server::{ServerConfig, ServerError, SyncServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let matches = Command::new("tidal-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Reference WebSocket server for collaborative waves.")
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("max-peers")
                .long("max-peers")
                .value_name("N")
                .help("Maximum connections per wave"),
        )
        .arg(
            Arg::new("broadcast-capacity")
                .long("broadcast-capacity")
                .value_name("N")
                .help("Frames a slow connection may fall behind before it is dropped"),
        )
        .arg(
            Arg::new("heartbeat")
                .long("heartbeat")
                .value_name("SECS")
                .help("WebSocket ping interval, 0 to disable"),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .value_name("POLICY")
                .help("Handling of deltas against old versions (transform, reject-stale)"),
        )
        .arg(
            Arg::new("history-limit")
                .long("history-limit")
                .value_name("N")
                .help("Deltas kept per wavelet"),
        )
        .get_matches();

    env_logger::init();

    let mut config = ServerConfig::default();
    apply_cli_overrides(&mut config, &matches)?;

    log::info!("Starting tidal-server v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Configuration: {config:?}");

    SyncServer::new(config).run().await
}

fn apply_cli_overrides(config: &mut ServerConfig, matches: &ArgMatches) -> Result<(), ServerError> {
    if let Some(addr) = matches.get_one::<String>("bind") {
        config.bind_addr = addr.clone();
    }

    if let Some(peers) = matches.get_one::<String>("max-peers") {
        config.max_peers_per_room = peers
            .parse()
            .map_err(|e| format!("Invalid peer limit: {e}"))?;
    }

    if let Some(capacity) = matches.get_one::<String>("broadcast-capacity") {
        config.broadcast_capacity = capacity
            .parse()
            .map_err(|e| format!("Invalid broadcast capacity: {e}"))?;
    }

    if let Some(secs) = matches.get_one::<String>("heartbeat") {
        config.heartbeat_interval_secs = secs
            .parse()
            .map_err(|e| format!("Invalid heartbeat interval: {e}"))?;
    }

    if let Some(policy) = matches.get_one::<String>("policy") {
        config.submit_policy = match policy.as_str() {
            "transform" => SubmitPolicy::Transform,
            "reject-stale" => SubmitPolicy::RejectStale,
            _ => {
                return Err(format!(
                    "Invalid policy: {policy}. Valid options: transform, reject-stale"
                )
                .into())
            }
        };
    }

    if let Some(limit) = matches.get_one::<String>("history-limit") {
        config.history_limit = Some(
            limit
                .parse()
                .map_err(|e| format!("Invalid history limit: {e}"))?,
        );
    }

    Ok(())
}
