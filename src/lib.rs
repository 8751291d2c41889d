//! copysql - Stream tables between SQL backends through CSV
//!
//! A source backend runs a query and streams the result out as CSV; a
//! destination backend bulk-loads that stream into an existing table. Every
//! backend is a [`Driver`] built by name from a [`Registry`].
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use copysql::{Copier, CopyJob, Endpoint, Parameters, Registry};
//!
//! let registry = Arc::new(Registry::with_builtins()?);
//! let source = Endpoint::new("clickhouse", Parameters::new())
//!     .with("address", "ch1:8123,ch2:8123")
//!     .with("username", "default")
//!     .with("database", "events");
//! let destination = Endpoint::new("vertica", Parameters::new())
//!     .with("address", "vertica:5433")
//!     .with("username", "dbadmin")
//!     .with("password", "secret")
//!     .with("database", "analytics");
//!
//! let job = CopyJob::new(source, "SELECT * FROM clicks", destination, "public.clicks");
//! let report = Copier::new(registry).run(&job).await?;
//! ```

pub mod codec;
pub mod copier;
pub mod drivers;
pub mod error;
pub mod pipe;
pub mod registry;
pub mod traits;
pub mod types;

// Re-export main types for convenient access
pub use copier::{Copier, CopyJob, CopyOptions, CopyReport, Endpoint};
pub use error::{CopyPhase, CopySqlError, Result};
pub use registry::{DriverFactory, Registry, RegistryBuilder};
pub use traits::{ByteSink, ByteSource, Driver};
pub use types::{ConnectionParams, Parameters, Record};
