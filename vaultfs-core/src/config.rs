//! Daemon configuration, read from TOML.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration.  The usual `VAULT_*` environment variables are layered on
//! top with [`VaultConfig::apply_env`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDRESS: &str = "https://127.0.0.1:8200";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FSNAME: &str = "vaultfs";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Connection settings for the remote store.
///
/// `Debug` is manually implemented so the token never reaches the logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Inline token.  `VAULT_TOKEN` or `token_file` are preferred.
    #[serde(default)]
    pub token: Option<String>,
    /// File holding the token; `~/` is expanded.  Defaults to `~/.vault-token`.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// PEM bundle of extra trust roots for the server certificate.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Directory whose files are all loaded as PEM trust roots.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Accept any server certificate.  For development servers only.
    #[serde(default)]
    pub skip_verify: bool,
    /// Name to send as SNI and verify the certificate against, when it
    /// differs from the host in `address`.
    #[serde(default)]
    pub tls_server_name: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            token_file: None,
            namespace: None,
            timeout_secs: default_timeout_secs(),
            ca_cert: None,
            ca_path: None,
            skip_verify: false,
            tls_server_name: None,
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("token_file", &self.token_file)
            .field("namespace", &self.namespace)
            .field("timeout_secs", &self.timeout_secs)
            .field("ca_cert", &self.ca_cert)
            .field("ca_path", &self.ca_path)
            .field("skip_verify", &self.skip_verify)
            .field("tls_server_name", &self.tls_server_name)
            .finish()
    }
}

impl VaultConfig {
    /// Apply the `VAULT_*` client variables on top of the file values.
    /// `lookup` is `std::env::var` outside of tests.  Unparsable values are
    /// logged and ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(addr) = non_empty("VAULT_ADDR") {
            self.address = addr;
        }
        if let Some(token) = non_empty("VAULT_TOKEN") {
            self.token = Some(token);
        }
        if let Some(ns) = non_empty("VAULT_NAMESPACE") {
            self.namespace = Some(ns);
        }
        if let Some(path) = non_empty("VAULT_CACERT") {
            self.ca_cert = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty("VAULT_CAPATH") {
            self.ca_path = Some(PathBuf::from(path));
        }
        if let Some(name) = non_empty("VAULT_TLS_SERVER_NAME") {
            self.tls_server_name = Some(name);
        }
        if let Some(raw) = non_empty("VAULT_SKIP_VERIFY") {
            match parse_bool(&raw) {
                Some(skip) => self.skip_verify = skip,
                None => tracing::warn!(value = %raw, "ignoring invalid VAULT_SKIP_VERIFY"),
            }
        }
        if let Some(raw) = non_empty("VAULT_CLIENT_TIMEOUT") {
            match parse_timeout_secs(&raw) {
                Some(secs) => self.timeout_secs = secs,
                None => tracing::warn!(value = %raw, "ignoring invalid VAULT_CLIENT_TIMEOUT"),
            }
        }
    }

    /// The token file to fall back on, with `~/` expanded against `home`.
    pub fn token_file_path(&self, home: Option<&Path>) -> Option<PathBuf> {
        match &self.token_file {
            Some(path) => match (path.strip_prefix("~"), home) {
                (Ok(rest), Some(home)) => Some(home.join(rest)),
                (Ok(_), None) => None,
                (Err(_), _) => Some(path.clone()),
            },
            None => home.map(|h| h.join(".vault-token")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Where to mount.  A mountpoint given on the command line wins.
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    #[serde(default = "default_fsname")]
    pub fsname: String,
    /// Let users other than the mounting user see the tree.
    #[serde(default)]
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mountpoint: None,
            fsname: default_fsname(),
            allow_other: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Log every remote call (method and path only).
    #[serde(default)]
    pub log_requests: bool,
}

/// The spellings the Vault CLI accepts for booleans.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Whole seconds, bare or with an `s`, `m` or `h` unit.
fn parse_timeout_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, scale) = match raw.char_indices().last()? {
        (i, 's') => (&raw[..i], 1),
        (i, 'm') => (&raw[..i], 60),
        (i, 'h') => (&raw[..i], 3600),
        _ => (raw, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(scale)
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_fsname() -> String {
    DEFAULT_FSNAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.vault.address, DEFAULT_ADDRESS);
        assert_eq!(config.vault.timeout_secs, 60);
        assert!(config.vault.token.is_none());
        assert_eq!(config.mount.fsname, "vaultfs");
        assert!(!config.mount.allow_other);
        assert!(!config.service.log_requests);
    }

    #[test]
    fn parses_all_sections() {
        let config = Config::from_toml(
            r#"
            [vault]
            address = "http://127.0.0.1:8201"
            token_file = "/run/secrets/vault-token"
            namespace = "team-a"
            timeout_secs = 5

            [mount]
            mountpoint = "/mnt/vault"
            allow_other = true

            [service]
            log_requests = true
            "#,
        )
        .unwrap();
        assert_eq!(config.vault.address, "http://127.0.0.1:8201");
        assert_eq!(config.vault.namespace.as_deref(), Some("team-a"));
        assert_eq!(config.vault.timeout_secs, 5);
        assert_eq!(config.mount.mountpoint, Some(PathBuf::from("/mnt/vault")));
        assert_eq!(config.mount.fsname, "vaultfs");
        assert!(config.mount.allow_other);
        assert!(config.service.log_requests);
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(Config::from_toml("[vault]\ntimeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut vault = Config::from_toml("[vault]\naddress = \"http://file:8200\"\ntoken = \"file\"")
            .unwrap()
            .vault;
        let env: HashMap<&str, &str> = [
            ("VAULT_ADDR", "http://env:8200"),
            ("VAULT_TOKEN", ""),
            ("VAULT_NAMESPACE", "ns1"),
        ]
        .into_iter()
        .collect();
        vault.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(vault.address, "http://env:8200");
        // Empty variables are ignored.
        assert_eq!(vault.token.as_deref(), Some("file"));
        assert_eq!(vault.namespace.as_deref(), Some("ns1"));
    }

    #[test]
    fn tls_settings_from_file_and_env() {
        let mut vault = Config::from_toml(
            "[vault]\nca_cert = \"/etc/ssl/vault-ca.pem\"\ntls_server_name = \"vault.internal\"\n",
        )
        .unwrap()
        .vault;
        assert_eq!(vault.ca_cert, Some(PathBuf::from("/etc/ssl/vault-ca.pem")));
        assert!(!vault.skip_verify);

        let env: HashMap<&str, &str> = [
            ("VAULT_CAPATH", "/etc/ssl/vault.d"),
            ("VAULT_SKIP_VERIFY", "true"),
            ("VAULT_CLIENT_TIMEOUT", "2m"),
        ]
        .into_iter()
        .collect();
        vault.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(vault.ca_cert, Some(PathBuf::from("/etc/ssl/vault-ca.pem")));
        assert_eq!(vault.ca_path, Some(PathBuf::from("/etc/ssl/vault.d")));
        assert_eq!(vault.tls_server_name.as_deref(), Some("vault.internal"));
        assert!(vault.skip_verify);
        assert_eq!(vault.timeout_secs, 120);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut vault = VaultConfig::default();
        let env: HashMap<&str, &str> =
            [("VAULT_SKIP_VERIFY", "yes please"), ("VAULT_CLIENT_TIMEOUT", "soon")]
                .into_iter()
                .collect();
        vault.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert!(!vault.skip_verify);
        assert_eq!(vault.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn timeout_units() {
        assert_eq!(parse_timeout_secs("30"), Some(30));
        assert_eq!(parse_timeout_secs("30s"), Some(30));
        assert_eq!(parse_timeout_secs("1h"), Some(3600));
        assert_eq!(parse_timeout_secs("1.5s"), None);
        assert_eq!(parse_timeout_secs(""), None);
    }

    #[test]
    fn debug_redacts_token() {
        let vault = VaultConfig {
            token: Some("s.supersecret".into()),
            ..VaultConfig::default()
        };
        let shown = format!("{vault:?}");
        assert!(!shown.contains("supersecret"));
        assert!(shown.contains("[redacted]"));
    }

    #[test]
    fn token_file_expansion() {
        let home = Path::new("/home/u");
        let mut vault = VaultConfig::default();
        assert_eq!(
            vault.token_file_path(Some(home)),
            Some(PathBuf::from("/home/u/.vault-token"))
        );
        assert_eq!(vault.token_file_path(None), None);

        vault.token_file = Some(PathBuf::from("~/tokens/vault"));
        assert_eq!(
            vault.token_file_path(Some(home)),
            Some(PathBuf::from("/home/u/tokens/vault"))
        );

        vault.token_file = Some(PathBuf::from("/etc/vault-token"));
        assert_eq!(
            vault.token_file_path(None),
            Some(PathBuf::from("/etc/vault-token"))
        );
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mount]\nfsname = \"secrets\"\n").unwrap();
        let config = Config::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.mount.fsname, "secrets");
    }
}
