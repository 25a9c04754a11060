use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::auth::password::HashCost;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CLIENT_URL: &str = "http://localhost:5173";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REGISTER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub struct AppConfig {
    pub database_url: SecretString,
    pub host: IpAddr,
    pub port: u16,
    /// Only origin allowed by CORS.
    pub client_url: HeaderValue,
    pub db_max_connections: u32,
    pub hash_cost: HashCost,
    pub register_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .context("DATABASE_URL must be set")?;

        let client_url = lookup("CLIENT_URL").unwrap_or_else(|| DEFAULT_CLIENT_URL.into());
        let client_url = HeaderValue::from_str(client_url.trim())
            .with_context(|| format!("invalid CLIENT_URL {client_url:?}"))?;

        let defaults = HashCost::default();
        let hash_cost = HashCost {
            memory_kib: parse_or(&lookup, "PASSWORD_HASH_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_or(&lookup, "PASSWORD_HASH_ITERATIONS", defaults.iterations)?,
            parallelism: parse_or(&lookup, "PASSWORD_HASH_PARALLELISM", defaults.parallelism)?,
        };

        Ok(Self {
            database_url: SecretString::from(database_url),
            host: parse_or(&lookup, "APP_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_or(&lookup, "APP_PORT", DEFAULT_PORT)?,
            client_url,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            hash_cost,
            register_timeout: Duration::from_secs(parse_or(
                &lookup,
                "REGISTER_TIMEOUT_SECS",
                DEFAULT_REGISTER_TIMEOUT_SECS,
            )?),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Optional variable: absent means `default`, present but unparseable is an error.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} {raw:?}")),
        None => Ok(default),
    }
}
