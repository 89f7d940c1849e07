use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `CLINICSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "clinicslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());
        Self {
            port: parsed("CLINICSLOT_PORT").unwrap_or(defaults.port),
            bind: lookup("CLINICSLOT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CLINICSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("CLINICSLOT_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "CLINICSLOT_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse_or(&lookup, "CLINICSLOT_COMPACT_THRESHOLD", defaults.compact_threshold),
            tls_cert: lookup("CLINICSLOT_TLS_CERT"),
            tls_key: lookup("CLINICSLOT_TLS_KEY"),
            metrics_port: parsed("CLINICSLOT_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("clinicslot.wal")
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
