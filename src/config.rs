//! Server configuration — a small YAML file, all fields required.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Data directory; the SQLite database lives here.
    pub path: PathBuf,
    /// Hex-encoded ed25519 public key (32 bytes).
    pub public_key: String,
    /// Hex-encoded ed25519 private key (64 bytes, seed || public).
    pub private_key: String,
    /// Origins allowed on the HTTP front door.
    pub allowed_origins: Vec<String>,
    pub api_port: u16,
}

/// Default config location: `~/.config/symmetry/server.yaml`.
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("symmetry")
        .join("server.yaml")
}

pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("Malformed config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.path.as_os_str().is_empty() {
        bail!("config: path must not be empty");
    }
    if config.public_key.trim().is_empty() {
        bail!("config: publicKey must not be empty");
    }
    if config.private_key.trim().is_empty() {
        bail!("config: privateKey must not be empty");
    }
    if config.api_port == 0 {
        bail!("config: apiPort must be a nonzero port number");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("server.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "path: /var/lib/symmetry\n\
             publicKey: \"aa11\"\n\
             privateKey: \"bb22\"\n\
             allowedOrigins:\n  - https://example.com\n\
             apiPort: 9000\n",
        );
        let config = load(&path).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.allowed_origins, vec!["https://example.com"]);
        assert_eq!(config.public_key, "aa11");
    }

    #[test]
    fn test_missing_field_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "path: /tmp/x\npublicKey: \"aa\"\napiPort: 9000\n");
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_non_numeric_port_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "path: /tmp/x\npublicKey: \"aa\"\nprivateKey: \"bb\"\nallowedOrigins: []\napiPort: nine\n",
        );
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_absent_file_aborts() {
        assert!(load(Path::new("/definitely/not/here.yaml")).is_err());
    }
}
