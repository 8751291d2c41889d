use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{CopySqlError, Result};

/// Untyped backend parameters as produced by configuration loading.
pub type Parameters = HashMap<String, Value>;

/// Narrow a parameter set into a backend's typed configuration.
///
/// Keys are matched case-insensitively. Two keys that differ only in case,
/// unknown keys (when the target denies them), missing required keys and
/// mistyped values are all configuration errors.
pub fn narrow<T: DeserializeOwned>(backend: &str, parameters: &Parameters) -> Result<T> {
    let mut object = Map::with_capacity(parameters.len());
    for (key, value) in parameters {
        let normalized = key.to_ascii_lowercase();
        if object.insert(normalized, value.clone()).is_some() {
            return Err(CopySqlError::configuration(
                backend,
                format!("parameter `{}` given more than once", key),
            ));
        }
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|e| CopySqlError::configuration(backend, e))
}

/// Connection settings shared by the SQL backends.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionParams {
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

impl ConnectionParams {
    pub fn from_parameters(backend: &str, parameters: &Parameters) -> Result<Self> {
        let params: Self = narrow(backend, parameters)?;
        if params.address.trim().is_empty() {
            return Err(CopySqlError::configuration(backend, "`address` is empty"));
        }
        Ok(params)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Split `host[:port]` (or `[v6]:port`), falling back to `default_port`.
pub fn split_host_port(backend: &str, address: &str, default_port: u16) -> Result<(String, u16)> {
    let address = address.trim();
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            CopySqlError::configuration(backend, format!("unterminated IPv6 address `{}`", address))
        })?;
        (host, tail.strip_prefix(':'))
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (address, None),
        }
    };

    if host.is_empty() {
        return Err(CopySqlError::configuration(
            backend,
            format!("missing host in `{}`", address),
        ));
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| {
            CopySqlError::configuration(backend, format!("invalid port in `{}`", address))
        })?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}
