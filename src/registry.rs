use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::drivers::{clickhouse, pg_wire, ClickHouseDriver, PgWireDriver};
use crate::error::{CopySqlError, Result};
use crate::traits::Driver;
use crate::types::Parameters;

/// Builds unopened drivers for one backend from a parameter set.
pub trait DriverFactory: Send + Sync {
    fn create(&self, parameters: &Parameters) -> Result<Box<dyn Driver>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&Parameters) -> Result<Box<dyn Driver>> + Send + Sync,
{
    fn create(&self, parameters: &Parameters) -> Result<Box<dyn Driver>> {
        self(parameters)
    }
}

/// Collects factories at startup. Each name may be registered once.
#[derive(Default)]
pub struct RegistryBuilder {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. A name that is already taken is a
    /// startup error.
    pub fn register(
        mut self,
        name: impl Into<String>,
        factory: impl DriverFactory + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(CopySqlError::DuplicateBackend(name));
        }

        debug!(backend = %name, "registered backend factory");
        self.factories.insert(name, Arc::new(factory));
        Ok(self)
    }

    /// Register the bundled backends: clickhouse, vertica and postgres.
    pub fn with_builtins(self) -> Result<Self> {
        self.register(clickhouse::DRIVER_NAME, ClickHouseDriver::factory)?
            .register(pg_wire::Flavor::Vertica.name(), PgWireDriver::vertica)?
            .register(pg_wire::Flavor::Postgres.name(), PgWireDriver::postgres)
    }

    pub fn build(self) -> Registry {
        Registry {
            factories: self.factories,
        }
    }
}

/// Immutable mapping from backend name to driver factory.
pub struct Registry {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// A registry holding only the bundled backends.
    pub fn with_builtins() -> Result<Self> {
        Ok(RegistryBuilder::new().with_builtins()?.build())
    }

    /// Create an unopened driver for `name`.
    pub fn create(&self, name: &str, parameters: &Parameters) -> Result<Box<dyn Driver>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CopySqlError::UnknownBackend(name.to_string()))?;

        debug!(backend = %name, "creating driver");
        factory.create(parameters)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered backend names in sorted order.
    pub fn backends(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("backends", &self.backends())
            .finish()
    }
}
