use std::process;

use clap::Parser;
use pacer::{
    config::DEFAULT_PORT,
    init_logging,
    peer::{Peer, PeerConfig},
};
use tracing::{error, info};

/// Answers POSTs slowly, a few keep-alive requests per connection.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Options {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() {
    init_logging();
    let options = Options::parse();
    info!(port = options.port, "using port");

    let result = Peer::bind(("0.0.0.0", options.port), PeerConfig::default())
        .and_then(|peer| peer.run());
    match result {
        Ok(never) => match never {},
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}
