use std::env;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use dotenv::dotenv;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3333";
pub const DEFAULT_OTLP_ENDPOINT: &str = "https://ingest.lightstep.com:443/traces/otlp/v0.9";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub trace: TraceSettings,
}

/// Where finished spans are shipped. Export is off when no token is set.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSettings {
    pub endpoint: String,
    pub access_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Settings> {
        dotenv().ok();
        Settings::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL env var must be set!")?;

        let raw_addr = lookup("EMS_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = raw_addr
            .parse()
            .with_context(|| format!("EMS_LISTEN_ADDR is not a socket address: {}", raw_addr))?;

        let log_filter = lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let trace = TraceSettings {
            endpoint: lookup("EMS_OTLP_ENDPOINT").unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),
            access_token: lookup("EMS_TRACE_TOKEN").filter(|token| !token.trim().is_empty()),
        };

        Ok(Settings {
            database_url,
            listen_addr,
            log_filter,
            trace,
        })
    }
}
