//! JSON config files and the flag > env > file > default merge.
//!
//! clap already folds flags and environment variables into one `Option`
//! per setting, so merging only has to fall back to the file and then to
//! the library defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use metricpush_agent::AgentConfig;
use metricpush_server::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid duration {0:?} (expected e.g. \"300ms\", \"1s\", \"5m\", \"1h\")")]
    Duration(String),
    #[error("{0} interval must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Parse `"300ms"`, `"10s"`, `"5m"` or `"1h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };
    let n: u64 = numeric
        .trim()
        .parse()
        .map_err(|_| ConfigError::Duration(s.to_string()))?;
    n.checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::Duration(s.to_string()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn duration(field: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    field.map(parse_duration).transpose()
}

fn non_zero(name: &'static str, every: Duration) -> Result<Duration, ConfigError> {
    if every.is_zero() {
        return Err(ConfigError::ZeroInterval(name));
    }
    Ok(every)
}

/// Treat empty strings from flags, env or file as unset.
fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentFile {
    pub address: Option<String>,
    pub grpc: Option<bool>,
    pub batch: Option<bool>,
    pub report_interval: Option<String>,
    pub poll_interval: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub rate_limit: Option<usize>,
}

impl AgentFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }
}

/// Agent settings as given on the command line or in the environment.
#[derive(Debug, Default)]
pub struct AgentOverrides {
    pub address: Option<String>,
    pub grpc: Option<bool>,
    pub batch: Option<bool>,
    pub report_interval: Option<u64>,
    pub poll_interval: Option<u64>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub rate_limit: Option<usize>,
}

/// Zero report or poll intervals are rejected.
pub fn resolve_agent(cli: AgentOverrides, file: AgentFile) -> Result<AgentConfig, ConfigError> {
    let defaults = AgentConfig::default();
    let report_interval = cli
        .report_interval
        .map(Duration::from_secs)
        .or(duration(file.report_interval.as_deref())?)
        .unwrap_or(defaults.report_interval);
    let poll_interval = cli
        .poll_interval
        .map(Duration::from_secs)
        .or(duration(file.poll_interval.as_deref())?)
        .unwrap_or(defaults.poll_interval);
    Ok(AgentConfig {
        address: cli.address.or(file.address).unwrap_or(defaults.address),
        grpc: cli.grpc.or(file.grpc).unwrap_or(defaults.grpc),
        batch: cli.batch.or(file.batch).unwrap_or(defaults.batch),
        report_interval: non_zero("report", report_interval)?,
        poll_interval: non_zero("poll", poll_interval)?,
        key: non_empty(cli.key.or(file.key)),
        crypto_key: cli.crypto_key.or(file.crypto_key).filter(|p| !p.as_os_str().is_empty()),
        rate_limit: cli.rate_limit.or(file.rate_limit).unwrap_or(defaults.rate_limit).max(1),
    })
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerFile {
    pub address: Option<String>,
    pub grpc_address: Option<String>,
    pub restore: Option<bool>,
    pub store_interval: Option<String>,
    pub store_file: Option<String>,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
}

impl ServerFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }
}

#[derive(Debug, Default)]
pub struct ServerOverrides {
    pub address: Option<String>,
    pub grpc_address: Option<String>,
    pub restore: Option<bool>,
    pub store_interval: Option<u64>,
    pub store_file: Option<String>,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
}

pub fn resolve_server(cli: ServerOverrides, file: ServerFile) -> Result<ServerConfig, ConfigError> {
    let defaults = ServerConfig::default();
    // an explicitly empty store file disables snapshots
    let store_file = match cli.store_file.or(file.store_file) {
        Some(path) if path.is_empty() => None,
        Some(path) => Some(PathBuf::from(path)),
        None => defaults.store_file,
    };
    Ok(ServerConfig {
        address: cli.address.or(file.address).unwrap_or(defaults.address),
        grpc_address: non_empty(cli.grpc_address.or(file.grpc_address)),
        store_interval: cli
            .store_interval
            .map(Duration::from_secs)
            .or(duration(file.store_interval.as_deref())?)
            .unwrap_or(defaults.store_interval),
        store_file,
        restore: cli.restore.or(file.restore).unwrap_or(defaults.restore),
        key: non_empty(cli.key.or(file.key)),
        database_dsn: non_empty(cli.database_dsn.or(file.database_dsn)),
        crypto_key: cli.crypto_key.or(file.crypto_key).filter(|p| !p.as_os_str().is_empty()),
        trusted_subnet: non_empty(cli.trusted_subnet.or(file.trusted_subnet)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Durations
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 10 ").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("").is_err());
    }

    // -----------------------------------------------------------------------
    // Agent precedence
    // -----------------------------------------------------------------------

    #[test]
    fn test_agent_defaults() {
        let cfg = resolve_agent(AgentOverrides::default(), AgentFile::default()).unwrap();
        assert_eq!(cfg.address, "127.0.0.1:8080");
        assert_eq!(cfg.report_interval, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.rate_limit, 1);
        assert!(cfg.key.is_none());
    }

    #[test]
    fn test_agent_file_then_cli() {
        let file: AgentFile = serde_json::from_str(
            r#"{"address":"file:1","grpc":true,"report_interval":"1s","poll_interval":"500ms","crypto_key":"/keys/public.pem"}"#,
        )
        .unwrap();
        let cli = AgentOverrides {
            address: Some("cli:2".into()),
            report_interval: Some(4),
            key: Some(String::new()),
            rate_limit: Some(0),
            ..AgentOverrides::default()
        };
        let cfg = resolve_agent(cli, file).unwrap();
        assert_eq!(cfg.address, "cli:2");
        assert!(cfg.grpc);
        assert_eq!(cfg.report_interval, Duration::from_secs(4));
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.crypto_key, Some(PathBuf::from("/keys/public.pem")));
        assert!(cfg.key.is_none());
        assert_eq!(cfg.rate_limit, 1);
    }

    #[test]
    fn test_agent_file_bad_duration() {
        let file = AgentFile {
            poll_interval: Some("often".into()),
            ..AgentFile::default()
        };
        assert!(matches!(
            resolve_agent(AgentOverrides::default(), file),
            Err(ConfigError::Duration(_))
        ));
    }

    #[test]
    fn test_agent_zero_intervals_rejected() {
        let cli = AgentOverrides {
            report_interval: Some(0),
            ..AgentOverrides::default()
        };
        assert!(matches!(
            resolve_agent(cli, AgentFile::default()),
            Err(ConfigError::ZeroInterval("report"))
        ));

        let file = AgentFile {
            poll_interval: Some("0ms".into()),
            ..AgentFile::default()
        };
        assert!(matches!(
            resolve_agent(AgentOverrides::default(), file),
            Err(ConfigError::ZeroInterval("poll"))
        ));

        // a flag overrides a zero in the file
        let file = AgentFile {
            poll_interval: Some("0s".into()),
            ..AgentFile::default()
        };
        let cli = AgentOverrides {
            poll_interval: Some(1),
            ..AgentOverrides::default()
        };
        assert_eq!(resolve_agent(cli, file).unwrap().poll_interval, Duration::from_secs(1));
    }

    // -----------------------------------------------------------------------
    // Server precedence
    // -----------------------------------------------------------------------

    #[test]
    fn test_server_defaults() {
        let cfg = resolve_server(ServerOverrides::default(), ServerFile::default()).unwrap();
        assert_eq!(cfg.store_interval, Duration::from_secs(300));
        assert_eq!(cfg.store_file, Some(PathBuf::from("/tmp/devops-metrics-db.json")));
        assert!(!cfg.restore);
        assert!(cfg.grpc_address.is_none());
    }

    #[test]
    fn test_server_file_values() {
        let file: ServerFile = serde_json::from_str(
            r#"{"address":"0.0.0.0:9000","restore":true,"store_interval":"0s","store_file":"","database_dsn":"postgres://db","trusted_subnet":"10.0.0.0/8"}"#,
        )
        .unwrap();
        let cfg = resolve_server(ServerOverrides::default(), file).unwrap();
        assert_eq!(cfg.address, "0.0.0.0:9000");
        assert!(cfg.restore);
        assert_eq!(cfg.store_interval, Duration::ZERO);
        assert!(cfg.store_file.is_none());
        assert_eq!(cfg.database_dsn.as_deref(), Some("postgres://db"));
        assert_eq!(cfg.trusted_subnet.as_deref(), Some("10.0.0.0/8"));
    }

    #[test]
    fn test_server_cli_overrides_file() {
        let file = ServerFile {
            restore: Some(true),
            store_file: Some("/var/file.json".into()),
            ..ServerFile::default()
        };
        let cli = ServerOverrides {
            restore: Some(false),
            store_file: Some("/var/cli.json".into()),
            store_interval: Some(2),
            ..ServerOverrides::default()
        };
        let cfg = resolve_server(cli, file).unwrap();
        assert!(!cfg.restore);
        assert_eq!(cfg.store_file, Some(PathBuf::from("/var/cli.json")));
        assert_eq!(cfg.store_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AgentFile::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
