use crate::stack::config::RemoteState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parameters that address the state object for backends we know about.
/// Anything else on these backends (credentials, region, lock tables,
/// encryption flags) only affects how the object is reached.
fn address_parameters(backend: &str) -> Option<&'static [&'static str]> {
    match backend {
        "s3" => Some(&["bucket", "key", "workspace_key_prefix"]),
        "gcs" => Some(&["bucket", "prefix"]),
        "azurerm" => Some(&["storage_account_name", "container_name", "key"]),
        "consul" => Some(&["address", "path"]),
        "pg" => Some(&["conn_str", "schema_name"]),
        "http" => Some(&["address"]),
        "remote" | "cloud" => Some(&["hostname", "organization", "workspaces"]),
        _ => None,
    }
}

/// Parameters ignored for backends without a known address set
const OPERATIONAL_PARAMETERS: &[&str] = &[
    "region",
    "profile",
    "role_arn",
    "access_key",
    "secret_key",
    "token",
    "credentials",
    "encrypt",
    "dynamodb_table",
    "skip_credentials_validation",
    "skip_metadata_api_check",
    "shared_credentials_file",
    "sts_endpoint",
    "endpoint",
];

/// Backends whose state lives on the local machine and is never shared
const LOCAL_BACKENDS: &[&str] = &["local"];

/// Canonical identity of a persisted remote state object.
///
/// Two modules with equal identities write the same state and must never
/// mutate it at the same time, whatever their place in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteStateIdentity {
    backend: String,
    address: BTreeMap<String, String>,
}

impl RemoteStateIdentity {
    /// Derive the identity of a backend descriptor. Returns `None` for local
    /// state or a backend with no addressing parameters at all.
    pub fn from_remote_state(remote_state: &RemoteState) -> Option<Self> {
        let backend = remote_state.backend.trim().to_ascii_lowercase();
        if backend.is_empty() || LOCAL_BACKENDS.contains(&backend.as_str()) {
            return None;
        }

        let address: BTreeMap<String, String> = match address_parameters(&backend) {
            Some(keys) => remote_state
                .config
                .iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => remote_state
                .config
                .iter()
                .filter(|(k, _)| !OPERATIONAL_PARAMETERS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        if address.is_empty() {
            return None;
        }

        Some(Self { backend, address })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn address(&self) -> &BTreeMap<String, String> {
        &self.address
    }

    /// Stable string form, used as the lock key
    pub fn lock_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RemoteStateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", Escaped(&self.backend))?;
        for (i, (key, value)) in self.address.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", Escaped(key), Escaped(value))?;
        }
        Ok(())
    }
}

/// Percent-encodes the key separators so distinct identities never render
/// to the same key
struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '%' => f.write_str("%25")?,
                ',' => f.write_str("%2C")?,
                '=' => f.write_str("%3D")?,
                ':' => f.write_str("%3A")?,
                c => write!(f, "{c}")?,
            }
        }
        Ok(())
    }
}
