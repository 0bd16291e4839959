use std::process;

use clap::Parser;
use pacer::{
    config::{Config, Options},
    init_logging,
};
use tracing::{error, info};

fn main() {
    init_logging();

    let config = Config::from(Options::parse());
    info!(port = config.port, url = %config.url(), "using port");

    let result = pacer::client(&config).and_then(|mut reactor| reactor.run());
    match result {
        Ok(never) => match never {},
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}
