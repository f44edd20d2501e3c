use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "wsproxy", version, about = "WebSocket to TCP tunnelling proxy")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "wsproxy.yaml")]
    pub config: PathBuf,

    /// Port to listen on (overrides the port of the configured listen address)
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Comma-separated `host:port` targets clients may reach (empty = all)
    #[arg(short, long, env = "WSPROXY_ALLOW")]
    pub allow: Option<String>,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,
}
