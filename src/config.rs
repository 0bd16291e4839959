use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use crate::{engine::curl::Request, error::Result};

pub const DEFAULT_PORT: u16 = 8000;

/// Sends a POST to a local peer, waits five seconds after every response, repeats.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Options {
    /// Port the peer listens on
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

/// The JSON document posted on every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    pub payload: u32,
}

impl Default for Payload {
    fn default() -> Self {
        Self { payload: 1337 }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub payload: Payload,
    /// Delay between a completion and the next request.
    pub pacing: Duration,
    /// Events returned by a single wait at most.
    pub events_capacity: usize,
    /// How long each detached worker keeps running.
    pub worker_hold: Duration,
    /// libcurl's own verbose trace on stderr.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            path: "/".into(),
            payload: Payload::default(),
            pacing: Duration::from_secs(5),
            events_capacity: 8,
            worker_hold: Duration::from_secs(3600),
            verbose: true,
        }
    }
}

impl From<Options> for Config {
    fn from(options: Options) -> Self {
        Self {
            port: options.port,
            ..Default::default()
        }
    }
}

impl Config {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn request(&self) -> Result<Request> {
        Ok(Request {
            url: self.url(),
            body: serde_json::to_vec(&self.payload)?,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_port_8000() {
        let options = Options::try_parse_from(["pacer"]).unwrap();
        let config = Config::from(options);
        assert_eq!(config.url(), "http://localhost:8000/");
        assert_eq!(config.pacing, Duration::from_secs(5));
    }

    #[test]
    fn port_is_positional() {
        let options = Options::try_parse_from(["pacer", "8123"]).unwrap();
        assert_eq!(Config::from(options).url(), "http://localhost:8123/");
        assert!(Options::try_parse_from(["pacer", "--port", "8123"]).is_err());
        assert!(Options::try_parse_from(["pacer", "http"]).is_err());
    }

    #[test]
    fn posts_the_json_payload() {
        let request = Config::default().request().unwrap();
        assert_eq!(request.body, br#"{"payload":1337}"#);
        assert!(request.verbose);
    }
}
