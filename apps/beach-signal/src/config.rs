use std::env;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use tracing::warn;

/// How inbound connections prove their identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Anyone may connect; identity comes from `register`
    None,
    /// Token in the second `Sec-WebSocket-Protocol` value
    Header,
    /// Token in the `token` query parameter
    Query,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(AuthMode::None),
            "header" | "subprotocol" => Ok(AuthMode::Header),
            "query" => Ok(AuthMode::Query),
            other => Err(format!("unknown auth mode '{other}'")),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::None => "none",
            AuthMode::Header => "header",
            AuthMode::Query => "query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_mode: AuthMode,
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    pub jwks_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env::var("BEACH_SIGNAL_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let auth_mode = match env::var("BEACH_SIGNAL_AUTH_MODE") {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                warn!("{}; falling back to {}", err, defaults.auth_mode);
                defaults.auth_mode
            }),
            Err(_) => defaults.auth_mode,
        };
        let jwks_timeout_seconds = env::var("BEACH_SIGNAL_JWKS_TIMEOUT")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.jwks_timeout_seconds);

        Self {
            port,
            auth_mode,
            jwks_url: non_empty_var("BEACH_SIGNAL_JWKS_URL"),
            jwt_issuer: non_empty_var("BEACH_SIGNAL_JWT_ISSUER"),
            jwt_audience: non_empty_var("BEACH_SIGNAL_JWT_AUDIENCE"),
            jwks_timeout_seconds,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_mode: AuthMode::None,
            jwks_url: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwks_timeout_seconds: 10,
        }
    }
}
