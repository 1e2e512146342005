use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use concord_server::config::{Cli, Config};
use concord_server::oauth::HttpIdentityProvider;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    // Use JSON logs in production (CONCORD_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("CONCORD_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("concord_server={}", config.log_level).parse()?)
        .add_directive(format!("concord_p2p={}", config.log_level).parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(env = %config.env, "starting concord server on {}", config.server_host);
    if config.p2p.enabled {
        tracing::info!(
            mdns = config.p2p.mdns,
            dht = config.p2p.dht,
            "overlay host enabled"
        );
    }

    let provider = Arc::new(HttpIdentityProvider::new(config.oauth.clone()));
    let state = concord_server::server::build_state(config, provider)?;
    concord_server::server::run(state).await
}
