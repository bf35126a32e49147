//! Command-line / environment configuration.
//!
//! [`Args`] is what clap parses; [`Config`] is the validated result the rest
//! of the crate consumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::cache::EvictionPolicy;
use crate::metadata::DEFAULT_METADATA_HOST;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8100;
const DEFAULT_CACHE_DURATION: &str = "30m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProxyMode {
    /// Act as the client's HTTP(S) proxy, intercepting CONNECT tunnels.
    Forward,
    /// Front a single fixed upstream under `/idtoken/proxy`.
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "gcloud-auth-proxy")]
#[command(about = "Attaches Google-issued ID tokens to outbound HTTP requests", long_about = None)]
#[command(version)]
pub struct Args {
    /// Default audience for minted tokens
    #[arg(long, env = "DEFAULT_AUDIENCE")]
    pub audience: String,

    /// Server host
    #[arg(long, default_value = DEFAULT_HOST, env = "SERVER_HOST")]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SERVER_PORT")]
    pub port: u16,

    /// How long a token source stays cached (Go duration syntax, e.g. 30m, 1h30m)
    #[arg(long, default_value = DEFAULT_CACHE_DURATION, env = "TOKEN_SOURCE_CACHE_DURATION")]
    pub token_source_cache_duration: String,

    /// Proxy strategy served on /idtoken/proxy
    #[arg(long, value_enum, default_value_t = ProxyMode::Forward, env = "PROXY_MODE")]
    pub proxy_mode: ProxyMode,

    /// Upstream base URL (reverse mode only)
    #[arg(long, env = "PROXY_UPSTREAM")]
    pub upstream: Option<String>,

    /// Verbose logging of every intercepted request (forward mode)
    #[arg(long, env = "DEBUG_PROXY")]
    pub debug_proxy: bool,

    /// PEM certificate of the CA used to intercept CONNECT tunnels
    #[arg(long, env = "PROXY_CA_CERT", requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// PEM private key of the interception CA
    #[arg(long, env = "PROXY_CA_KEY", requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Metadata server host[:port]
    #[arg(long, default_value = DEFAULT_METADATA_HOST, env = "GCE_METADATA_HOST")]
    pub metadata_host: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("default audience must not be empty")]
    EmptyAudience,

    #[error("server host must not be empty")]
    EmptyHost,

    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("--upstream is required in reverse proxy mode")]
    MissingUpstream,

    #[error("invalid upstream URL {url:?}: {reason}")]
    InvalidUpstream { url: String, reason: String },

    #[error("--ca-cert and --ca-key must be given together")]
    IncompleteCa,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySettings {
    Forward { verbose: bool, ca: Option<CaPaths> },
    Reverse { upstream: reqwest::Url },
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host name or IP literal (without brackets) to listen on.
    pub host: String,
    pub port: u16,
    pub default_audience: String,
    pub cache_ttl: Duration,
    pub eviction: EvictionPolicy,
    pub proxy: ProxySettings,
    pub metadata_host: String,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.audience.is_empty() {
            return Err(ConfigError::EmptyAudience);
        }

        let host = args.host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let cache_ttl = parse_go_duration(&args.token_source_cache_duration)?;

        let proxy = match args.proxy_mode {
            ProxyMode::Reverse => {
                let raw = args.upstream.ok_or(ConfigError::MissingUpstream)?;
                ProxySettings::Reverse {
                    upstream: parse_upstream(&raw)?,
                }
            }
            ProxyMode::Forward => {
                let ca = match (args.ca_cert, args.ca_key) {
                    (Some(cert), Some(key)) => Some(CaPaths { cert, key }),
                    (None, None) => None,
                    _ => return Err(ConfigError::IncompleteCa),
                };
                ProxySettings::Forward {
                    verbose: args.debug_proxy,
                    ca,
                }
            }
        };

        Ok(Self {
            host: host.to_string(),
            port: args.port,
            default_audience: args.audience,
            cache_ttl,
            eviction: EvictionPolicy::Expired,
            proxy,
            metadata_host: args.metadata_host,
        })
    }

    pub fn proxy_mode(&self) -> ProxyMode {
        match self.proxy {
            ProxySettings::Forward { .. } => ProxyMode::Forward,
            ProxySettings::Reverse { .. } => ProxyMode::Reverse,
        }
    }
}

fn parse_upstream(raw: &str) -> Result<reqwest::Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUpstream {
        url: raw.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Parse a Go `time.ParseDuration` string: an optionally signed sequence of
/// decimal numbers with unit suffixes (`ns`, `us`/`µs`, `ms`, `s`, `m`, `h`),
/// e.g. `300ms`, `1.5h`, `2h45m`. Negative durations are rejected.
pub fn parse_go_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut s = input;
    let negative = if let Some(rest) = s.strip_prefix('-') {
        s = rest;
        true
    } else {
        s = s.strip_prefix('+').unwrap_or(s);
        false
    };

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total_nanos: f64 = 0.0;
    while !s.is_empty() {
        let num_len = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (num, rest) = s.split_at(num_len);
        if num.is_empty() || num == "." || num.matches('.').count() > 1 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = num.parse().map_err(|_| invalid("expected a number"))?;

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        total_nanos += value * scale;
        s = rest;
    }

    if negative && total_nanos > 0.0 {
        return Err(invalid("duration must not be negative"));
    }
    if total_nanos > u64::MAX as f64 {
        return Err(invalid("duration out of range"));
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
