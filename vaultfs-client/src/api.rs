use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{
    Certificate, Client as HttpClient, ClientBuilder, Method, RequestBuilder, Response,
    StatusCode, Url,
};
use serde_json::Value;
use tracing::{debug, warn};
use vaultfs_core::config::VaultConfig;
use vaultfs_core::{MountInfo, SEPARATOR, SecretData, SecretStore, StoreError};
use zeroize::Zeroizing;

use crate::error::{VaultApiError, error_message};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct VaultClient {
    http: HttpClient,
    /// Base address without a trailing `/`, as configured.
    address: String,
    /// Where requests go.  Differs from `address` in its host when a TLS
    /// server name is configured.
    base: Url,
    token: Option<Zeroizing<String>>,
    namespace: Option<String>,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl VaultClient {
    /// Build a client from resolved configuration.
    ///
    /// Environment overrides must already be applied to `config`; the token
    /// falls back to the token file when none is configured.
    pub fn new(config: &VaultConfig) -> Result<Self, VaultApiError> {
        let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
        let token = resolve_token(config, home.as_deref())?;
        if token.is_none() {
            debug!("no Vault token configured; requests are unauthenticated");
        }

        let mut base = Url::parse(&config.address)
            .map_err(|e| VaultApiError::InvalidAddress(format!("{}: {e}", config.address)))?;
        if base.cannot_be_a_base() {
            return Err(VaultApiError::InvalidAddress(config.address.clone()));
        }

        let builder = HttpClient::builder()
            .user_agent(format!("vaultfs/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10));
        let builder = configure_tls(builder, config, &mut base)?;
        let http = builder.build()?;

        Ok(Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            base,
            token,
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `<base>/v1/<path>` with every path segment percent-encoded, so a
    /// key such as `a?b` stays one segment instead of starting a query.
    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("v1").extend(
                path.split(SEPARATOR)
                    .filter(|segment| !segment.is_empty() && *segment != "."),
            );
        }
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.http.request(method, self.url(path));
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token.as_str());
        }
        if let Some(ns) = &self.namespace {
            req = req.header(NAMESPACE_HEADER, ns);
        }
        req
    }

    /// Turn a non-2xx response into an error, preserving Vault's messages.
    async fn check(resp: Response, what: &str) -> Result<Response, VaultApiError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(VaultApiError::Api {
            status: status.as_u16(),
            message: format!("{what}: {}", error_message(&body)),
        })
    }

    pub async fn list_mounts(&self) -> Result<BTreeMap<String, MountInfo>, VaultApiError> {
        debug!("Vault list mounts");
        let resp = self.request(Method::GET, "sys/mounts").send().await?;
        let resp = Self::check(resp, "list mounts").await?;
        let body: Value = resp.json().await?;
        let mounts = parse_mounts(body)?;
        debug!(count = mounts.len(), "Vault mounts fetched");
        Ok(mounts)
    }

    pub async fn list(&self, path: &str) -> Result<Vec<String>, VaultApiError> {
        debug!(%path, "Vault list");
        let resp = self
            .request(Method::GET, path)
            .query(&[("list", "true")])
            .send()
            .await?;
        // Vault answers 404 for a prefix with nothing under it.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = Self::check(resp, &format!("list {path}")).await?;
        let body: Value = resp.json().await?;
        parse_keys(body)
    }

    pub async fn read(&self, path: &str) -> Result<SecretData, VaultApiError> {
        debug!(%path, "Vault read");
        let resp = self.request(Method::GET, path).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(VaultApiError::NotFound(path.to_string()));
        }
        let resp = Self::check(resp, &format!("read {path}")).await?;
        let body: Value = resp.json().await?;
        parse_data(body)
    }

    pub async fn write(&self, path: &str, data: &SecretData) -> Result<(), VaultApiError> {
        debug!(%path, "Vault write");
        let resp = self.request(Method::PUT, path).json(data).send().await?;
        Self::check(resp, &format!("write {path}")).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecretStore for VaultClient {
    async fn list_mounts(&self) -> Result<BTreeMap<String, MountInfo>, StoreError> {
        Ok(VaultClient::list_mounts(self).await?)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        Ok(VaultClient::list(self, path).await?)
    }

    async fn read(&self, path: &str) -> Result<SecretData, StoreError> {
        Ok(VaultClient::read(self, path).await?)
    }

    async fn write(&self, path: &str, data: SecretData) -> Result<(), StoreError> {
        Ok(VaultClient::write(self, path, &data).await?)
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

fn configure_tls(
    mut builder: ClientBuilder,
    config: &VaultConfig,
    base: &mut Url,
) -> Result<ClientBuilder, VaultApiError> {
    for cert in load_ca_certs(config)? {
        builder = builder.add_root_certificate(cert);
    }
    if config.skip_verify {
        warn!("TLS certificate verification is disabled for the Vault server");
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(name) = config.tls_server_name.as_deref().filter(|n| !n.is_empty()) {
        // Connect to the configured host but present and verify `name`.
        let addr = base
            .socket_addrs(|| None)
            .ok()
            .and_then(|addrs| addrs.into_iter().next())
            .ok_or_else(|| VaultApiError::InvalidAddress(format!("cannot resolve {base}")))?;
        base.set_host(Some(name))
            .map_err(|e| VaultApiError::InvalidAddress(format!("TLS server name {name}: {e}")))?;
        debug!(%name, %addr, "Vault TLS server name override");
        builder = builder.resolve(name, addr);
    }
    Ok(builder)
}

/// Extra trust roots from `ca_cert` (a PEM bundle) and every file in
/// `ca_path`.
pub fn load_ca_certs(config: &VaultConfig) -> Result<Vec<Certificate>, VaultApiError> {
    let mut certs = Vec::new();
    if let Some(path) = &config.ca_cert {
        certs.extend(read_pem_bundle(path)?);
    }
    if let Some(dir) = &config.ca_path {
        let entries = std::fs::read_dir(dir).map_err(|source| VaultApiError::CaCert {
            path: dir.display().to_string(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        for file in files {
            certs.extend(read_pem_bundle(&file)?);
        }
    }
    Ok(certs)
}

fn read_pem_bundle(path: &Path) -> Result<Vec<Certificate>, VaultApiError> {
    let pem = std::fs::read(path).map_err(|source| VaultApiError::CaCert {
        path: path.display().to_string(),
        source,
    })?;
    let invalid = |message: String| VaultApiError::InvalidCaCert {
        path: path.display().to_string(),
        message,
    };
    let certs = Certificate::from_pem_bundle(&pem).map_err(|e| invalid(e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid("no PEM certificates found".into()));
    }
    debug!(path = %path.display(), count = certs.len(), "loaded CA certificates");
    Ok(certs)
}

// ---------------------------------------------------------------------------
// Token resolution
// ---------------------------------------------------------------------------

/// Inline token first, then the token file.  A missing token file is not an
/// error; an unreadable one is.
pub fn resolve_token(
    config: &VaultConfig,
    home: Option<&Path>,
) -> Result<Option<Zeroizing<String>>, VaultApiError> {
    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Some(Zeroizing::new(token.to_string())));
    }
    let Some(path) = config.token_file_path(home) else {
        return Ok(None);
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let raw = Zeroizing::new(raw);
            let token = raw.trim();
            if token.is_empty() {
                Ok(None)
            } else {
                debug!(path = %path.display(), "using Vault token file");
                Ok(Some(Zeroizing::new(token.to_string())))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(VaultApiError::TokenFile {
            path: path.display().to_string(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Mount table from a `sys/mounts` body.
///
/// Current servers wrap the table in `data`; older ones put the
/// `name/`-keyed entries at the top level next to the request metadata.
pub fn parse_mounts(body: Value) -> Result<BTreeMap<String, MountInfo>, VaultApiError> {
    let Value::Object(mut top) = body else {
        return Err(VaultApiError::Malformed("mount table is not an object".into()));
    };
    let table = match top.remove("data") {
        Some(Value::Object(data)) => data,
        _ => top,
    };
    table
        .into_iter()
        .filter(|(path, _)| path.ends_with('/'))
        .map(|(path, info)| {
            let info: MountInfo = serde_json::from_value(info)
                .map_err(|e| VaultApiError::Malformed(format!("mount {path}: {e}")))?;
            Ok((path, info))
        })
        .collect()
}

/// `data.keys` from a LIST body.  Absent keys mean an empty listing.
pub fn parse_keys(body: Value) -> Result<Vec<String>, VaultApiError> {
    let keys = match body.get("data").and_then(|d| d.get("keys")) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(keys)) => keys,
        Some(_) => return Err(VaultApiError::Malformed("\"keys\" is not an array".into())),
    };
    keys.iter()
        .map(|k| {
            k.as_str()
                .map(str::to_string)
                .ok_or_else(|| VaultApiError::Malformed(format!("non-string key {k}")))
        })
        .collect()
}

/// `data` from a read body.  A body without data reads as an empty object.
pub fn parse_data(body: Value) -> Result<SecretData, VaultApiError> {
    let Value::Object(mut top) = body else {
        return Err(VaultApiError::Malformed("response is not an object".into()));
    };
    match top.remove("data") {
        Some(Value::Object(data)) => Ok(data),
        None | Some(Value::Null) => Ok(SecretData::new()),
        Some(_) => Err(VaultApiError::Malformed("\"data\" is not an object".into())),
    }
}
