//! Logical-to-physical path translation per engine version.
//!
//! KV v2 keeps its listing and its values under different prefixes
//! (`metadata/` and `data/`) and wraps every value in a versioned envelope.
//! Users only ever see the logical path; the adjustor hides the rest.

use serde_json::Value;

use crate::node::NodeError;
use crate::{SEPARATOR, SecretData};

/// Path strategy of a mount, selected once when the mount is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathAdjustor {
    /// Listing and reading use the logical path unchanged (KV v1).
    #[default]
    Identity,
    /// Listing under `metadata/`, reading under `data/` (KV v2).
    KvV2,
}

impl PathAdjustor {
    /// Pick the adjustor for a `kv` mount from its `version` option.
    pub fn for_kv_version(version: Option<&str>) -> Self {
        match version {
            Some("2") => Self::KvV2,
            _ => Self::Identity,
        }
    }

    /// Physical path (relative to the mount) to list `logical`.
    pub fn list_path(self, logical: &str) -> String {
        match self {
            Self::Identity => join_path(&[logical]),
            Self::KvV2 => join_path(&["metadata", logical]),
        }
    }

    /// Physical path (relative to the mount) to read `logical`.
    pub fn read_path(self, logical: &str) -> String {
        match self {
            Self::Identity => join_path(&[logical]),
            Self::KvV2 => join_path(&["data", logical]),
        }
    }

    /// The part of a read result that becomes file content.
    ///
    /// KV v2 returns `{"data": {..}, "metadata": {..}}`; only the inner
    /// `data` object is the secret.
    pub fn secret_payload(self, mut data: SecretData) -> Result<SecretData, NodeError> {
        match self {
            Self::Identity => Ok(data),
            Self::KvV2 => match data.remove("data") {
                Some(Value::Object(inner)) => Ok(inner),
                // Soft-deleted or destroyed versions come back with `data: null`.
                Some(Value::Null) => Err(NodeError::NotFound("deleted secret version".into())),
                Some(other) => Err(NodeError::Encoding(format!(
                    "expected object under \"data\", found {}",
                    json_kind(&other)
                ))),
                None => Err(NodeError::Encoding(
                    "versioned secret has no \"data\" field".into(),
                )),
            },
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Join path segments with `/`, dropping empty and `.` components.
///
/// Leading, trailing and repeated separators disappear, so
/// `join_path(&["metadata", ""])` is `"metadata"` and
/// `join_path(&["kv/", "a/", "b"])` is `"kv/a/b"`.
pub fn join_path(parts: &[&str]) -> String {
    let mut out = String::new();
    for segment in parts
        .iter()
        .flat_map(|p| p.split(SEPARATOR))
        .filter(|s| !s.is_empty() && *s != ".")
    {
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(segment);
    }
    out
}
