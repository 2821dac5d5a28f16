//! Server configuration from `ROOMSHARE_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Compact the WAL once this many appends have accumulated.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub metrics_port: Option<u16>,
    /// Certificate and key paths; both or neither.
    pub tls: Option<(PathBuf, PathBuf)>,
}

#[derive(Debug)]
pub enum ConfigError {
    TlsPair,
    ZeroSweepInterval,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::TlsPair => {
                write!(f, "both ROOMSHARE_TLS_CERT and ROOMSHARE_TLS_KEY must be set, or neither")
            }
            ConfigError::ZeroSweepInterval => {
                write!(f, "ROOMSHARE_SWEEP_INTERVAL_SECS must be at least 1")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roomshare".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(5),
            metrics_port: None,
            tls: None,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sweep_secs: u64 = parse_var(&lookup, "ROOMSHARE_SWEEP_INTERVAL_SECS")
            .unwrap_or(defaults.sweep_interval.as_secs());
        if sweep_secs == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }

        let tls = match (lookup("ROOMSHARE_TLS_CERT"), lookup("ROOMSHARE_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::TlsPair),
        };

        Ok(Self {
            port: parse_var(&lookup, "ROOMSHARE_PORT").unwrap_or(defaults.port),
            bind: lookup("ROOMSHARE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ROOMSHARE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("ROOMSHARE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "ROOMSHARE_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "ROOMSHARE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: Duration::from_secs(sweep_secs),
            metrics_port: parse_var(&lookup, "ROOMSHARE_METRICS_PORT"),
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomshare.wal")
    }

    /// Build the TLS acceptor from the configured PEM files, if any.
    pub fn load_tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let Some((cert_path, key_path)) = &self.tls else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
