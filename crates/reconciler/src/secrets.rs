//! Secret references and the secret stores that resolve them.
//!
//! A string parameter of the form `vault:<path>#<field>` is a reference.
//! References are resolved right before each invocation and never cached,
//! so a retried run always sees the current secret.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use playop_core::{ParamSet, ParamValue};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::VaultConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry_transient};
use crate::variables::Environment;

const REF_PREFIX: &str = "vault:";

/// A parsed `vault:<path>#<field>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub path: String,
    pub field: String,
}

impl SecretRef {
    /// Parse a reference. Returns `None` for ordinary values.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(REF_PREFIX)?;
        let (path, field) = rest.rsplit_once('#')?;
        let path = path.trim_matches('/');
        if path.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self {
            path: path.to_string(),
            field: field.to_string(),
        })
    }
}

/// Key/value secret lookup by path.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read one field of the secret at `path`.
    async fn read(&self, path: &str, field: &str) -> Result<String>;
}

/// Find the secret store token: `VAULT_TOKEN`, then the token file.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when neither yields a token.
pub fn discover_token(env: &Environment, token_file: Option<&Path>) -> Result<String> {
    if let Some(token) = env.get("VAULT_TOKEN").map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    if let Some(path) = token_file {
        let token = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read vault token file {}: {e}", path.display()))
        })?;
        let token = token.trim();
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    Err(Error::configuration(
        "no vault token: set VAULT_TOKEN or configure a token file",
    ))
}

/// Vault KV secret store (v1 and v2 engines).
pub struct VaultSecretStore {
    client: reqwest::Client,
    address: Url,
    token: String,
}

impl VaultSecretStore {
    /// Create a store talking to `address` with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(address: Url, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::invalid_config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            address,
            token: token.into(),
        })
    }

    /// Build from configuration. `Ok(None)` if no address is configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an address is set but no token
    /// can be found.
    pub fn from_config(config: &VaultConfig, env: &Environment) -> Result<Option<Self>> {
        let Some(address) = config.address.clone() else {
            return Ok(None);
        };
        let token = discover_token(env, config.token_file.as_deref())?;
        Self::new(address, token).map(Some)
    }

    fn secret_url(&self, path: &str) -> Result<Url> {
        self.address
            .join(&format!("v1/{path}"))
            .map_err(|e| Error::configuration(format!("invalid secret path '{path}': {e}")))
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn read(&self, path: &str, field: &str) -> Result<String> {
        let url = self.secret_url(path)?;
        debug!(path, field, "Reading secret");

        let response = self
            .client
            .get(url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| Error::transient_io("secret lookup", e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transient_io(
                "secret lookup",
                format!("vault returned {status} for '{path}'"),
            ));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::configuration(format!("secret path '{path}' not found")));
        }
        if !status.is_success() {
            return Err(Error::configuration(format!(
                "vault returned {status} for '{path}'"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::transient_io("secret lookup", format!("invalid response body: {e}")))?;
        extract_field(&body, path, field)
    }
}

/// KV v2 nests the payload under `data.data`; v1 puts it under `data`.
fn extract_field(body: &Value, path: &str, field: &str) -> Result<String> {
    let data = body.get("data");
    let value = data
        .and_then(|d| d.get("data"))
        .and_then(|inner| inner.get(field))
        .or_else(|| data.and_then(|d| d.get(field)));

    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        _ => Err(Error::configuration(format!(
            "secret '{path}' has no field '{field}'"
        ))),
    }
}

/// In-memory secret store.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<(String, String), String>>,
}

impl InMemorySecretStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a secret field.
    pub fn insert(&self, path: impl Into<String>, field: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((path.into(), field.into()), value.into());
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn read(&self, path: &str, field: &str) -> Result<String> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(path.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| Error::configuration(format!("secret '{path}' has no field '{field}'")))
    }
}

/// Replace every secret reference in `params` with its current value.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if a reference cannot be resolved: no
/// store is configured, the secret does not exist, or lookups kept failing
/// until the retry budget ran out.
pub async fn resolve_secrets(
    params: ParamSet,
    store: Option<&dyn SecretStore>,
    policy: &RetryPolicy,
) -> Result<ParamSet> {
    let mut resolved = ParamSet::new();
    for (key, value) in params {
        let Some(reference) = value.as_str().and_then(SecretRef::parse) else {
            resolved.insert(key, value);
            continue;
        };
        let Some(store) = store else {
            return Err(Error::configuration(format!(
                "parameter '{key}' references a secret but no secret store is configured"
            )));
        };

        let secret = retry_transient(policy, "secret lookup", || {
            store.read(&reference.path, &reference.field)
        })
        .await
        .map_err(|e| {
            if e.is_transient() {
                Error::configuration(format!("secret lookup for '{key}' failed after retries: {e}"))
            } else {
                e
            }
        })?;
        resolved.insert(key, ParamValue::String(secret));
    }
    Ok(resolved)
}
