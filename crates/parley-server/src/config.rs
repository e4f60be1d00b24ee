use std::path::PathBuf;

use anyhow::Context;

use parley_relay::RelayConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    pub relay: RelayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.into());

        let port: u16 = var("PARLEY_PORT", "3000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let default_chunk_size: u64 = var("PARLEY_DEFAULT_CHUNK_SIZE", "16384")
            .parse()
            .context("PARLEY_DEFAULT_CHUNK_SIZE must be a byte count")?;
        let max_chunk_size: u64 = var("PARLEY_MAX_CHUNK_SIZE", "131072")
            .parse()
            .context("PARLEY_MAX_CHUNK_SIZE must be a byte count")?;
        anyhow::ensure!(
            default_chunk_size > 0 && default_chunk_size <= max_chunk_size,
            "PARLEY_DEFAULT_CHUNK_SIZE must be between 1 and PARLEY_MAX_CHUNK_SIZE"
        );

        Ok(Self {
            host: var("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: var("PARLEY_DB_PATH", "parley.db").into(),
            storage_dir: var("PARLEY_STORAGE_DIR", "./file-storage").into(),
            relay: RelayConfig {
                default_chunk_size,
                max_chunk_size,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.relay.default_chunk_size, 16384);
        assert_eq!(config.relay.max_chunk_size, 131072);
    }

    #[test]
    fn overrides_are_read() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PARLEY_PORT", "8080"),
            ("PARLEY_STORAGE_DIR", "/tmp/blobs"),
            ("PARLEY_DEFAULT_CHUNK_SIZE", "4096"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/blobs"));
        assert_eq!(config.relay.default_chunk_size, 4096);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("PARLEY_PORT", "x")])).is_err());
        assert!(
            ServerConfig::from_lookup(lookup(&[("PARLEY_DEFAULT_CHUNK_SIZE", "999999")])).is_err()
        );
    }
}
