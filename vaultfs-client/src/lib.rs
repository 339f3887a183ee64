//! Vault HTTP API client.
//!
//! Implements [`vaultfs_core::SecretStore`] on top of the four endpoints the
//! filesystem needs:
//!
//! | Capability      | Request                         |
//! |-----------------|---------------------------------|
//! | `list_mounts()` | `GET /v1/sys/mounts`            |
//! | `list(path)`    | `GET /v1/<path>?list=true`      |
//! | `read(path)`    | `GET /v1/<path>`                |
//! | `write(path)`   | `PUT /v1/<path>`                |
//!
//! There is no caching and no retry logic here; the request timeout comes
//! from configuration.

pub mod api;
pub mod error;

pub use api::VaultClient;
pub use error::VaultApiError;
