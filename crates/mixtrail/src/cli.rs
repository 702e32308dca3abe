use std::path::PathBuf;

use clap::Parser;

use mixtrail_core::config::Config;

/// Mixtrail — real-time CoinJoin detection and forward tracing with a
/// REST API over a property-graph store.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to the TOML configuration file. Without it, documented
    /// defaults apply.
    #[arg(long, env = "MIXTRAIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Block-explorer base URL (overrides the config file).
    #[arg(long, env = "MIXTRAIL_EXPLORER_URL")]
    pub explorer_url: Option<String>,

    /// Graph store HTTP URI (overrides the config file).
    #[arg(long, env = "MIXTRAIL_STORE_URI")]
    pub store_uri: Option<String>,

    /// Graph store username.
    #[arg(long, env = "MIXTRAIL_STORE_USER")]
    pub store_user: Option<String>,

    /// Graph store password.
    #[arg(long, env = "MIXTRAIL_STORE_PASS")]
    pub store_pass: Option<String>,

    /// Address to bind the web server to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Start the mempool monitor immediately instead of waiting for
    /// `POST /api/v1/monitoring/start`.
    #[arg(long)]
    pub monitor: bool,
}

impl Cli {
    /// Overlay explicit CLI/env values onto the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.explorer_url {
            config.explorer.base_url = url.clone();
        }
        if let Some(uri) = &self.store_uri {
            config.store.uri = uri.clone();
        }
        if let Some(user) = &self.store_user {
            config.store.user = Some(user.clone());
        }
        if let Some(pass) = &self.store_pass {
            config.store.pass = Some(pass.clone());
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}
