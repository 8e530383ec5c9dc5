use std::net::SocketAddr;

use clap::Parser;

use crate::config::{BackplaneConfig, DEFAULT_REDIS_ADDR, DEFAULT_REDIS_CHANNEL};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address for the HTTP and websocket listener. Give each local node its own port.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Redis address, either `host:port` or a full `redis://` URL.
    #[arg(long, env = "REDIS_ADDR", default_value = DEFAULT_REDIS_ADDR)]
    pub redis_addr: String,

    /// Shared channel every node publishes to and subscribes on.
    #[arg(long, env = "REDIS_CHANNEL", default_value = DEFAULT_REDIS_CHANNEL)]
    pub redis_channel: String,

    /// Skip the backplane entirely and route on this node only.
    #[arg(long)]
    pub no_backplane: bool,
}

impl Cli {
    pub fn backplane_config(&self) -> BackplaneConfig {
        BackplaneConfig {
            address: self.redis_addr.clone(),
            channel: self.redis_channel.clone(),
            ..BackplaneConfig::default()
        }
    }
}
