use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{CopyPhase, CopySqlError, Result};
use crate::pipe::pipe;
use crate::registry::Registry;
use crate::traits::Driver;
use crate::types::Parameters;

/// Default number of bytes buffered between source and destination.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// One side of a copy job: a registered backend name and its parameters.
#[derive(Clone)]
pub struct Endpoint {
    pub backend: String,
    pub parameters: Parameters,
}

impl Endpoint {
    pub fn new(backend: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            backend: backend.into(),
            parameters,
        }
    }

    /// Add or replace one parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

// Parameter values may hold credentials.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.parameters.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Endpoint")
            .field("backend", &self.backend)
            .field("parameters", &keys)
            .finish()
    }
}

/// Copy the result of `query` on `source` into the existing `table` on
/// `destination`.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub source: Endpoint,
    pub query: String,
    pub destination: Endpoint,
    pub table: String,
}

impl CopyJob {
    pub fn new(
        source: Endpoint,
        query: impl Into<String>,
        destination: Endpoint,
        table: impl Into<String>,
    ) -> Self {
        Self {
            source,
            query: query.into(),
            destination,
            table: table.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    pub pipe_capacity: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Outcome of a successful copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    /// Rows emitted by the source query.
    pub rows: u64,
    pub elapsed: Duration,
}

/// Runs copy jobs against the backends of a [`Registry`].
///
/// # Example
/// ```ignore
/// let copier = Copier::new(Arc::new(Registry::with_builtins()?));
/// let job = CopyJob::new(
///     Endpoint::new("clickhouse", clickhouse_params),
///     "SELECT id, name FROM users",
///     Endpoint::new("vertica", vertica_params),
///     "public.users",
/// );
/// let report = copier.run(&job).await?;
/// println!("copied {} rows", report.rows);
/// ```
#[derive(Debug, Clone)]
pub struct Copier {
    registry: Arc<Registry>,
    options: CopyOptions,
}

impl Copier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            options: CopyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CopyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> CopyOptions {
        self.options
    }

    /// Run one copy job end to end.
    ///
    /// Both drivers are closed before this returns, whatever the outcome.
    /// A close failure after a copy error is logged and the copy error is
    /// returned.
    pub async fn run(&self, job: &CopyJob) -> Result<CopyReport> {
        let started = Instant::now();
        info!(
            source = %job.source.backend,
            destination = %job.destination.backend,
            table = %job.table,
            "copy job started"
        );

        let mut source = self
            .registry
            .create(&job.source.backend, &job.source.parameters)?;
        let mut destination = self
            .registry
            .create(&job.destination.backend, &job.destination.parameters)?;

        let outcome = self
            .execute(source.as_mut(), destination.as_mut(), job)
            .await;

        let closed = [source.close().await, destination.close().await];
        let rows = match outcome {
            Ok(rows) => {
                for result in closed {
                    result?;
                }
                rows
            }
            Err(e) => {
                for err in closed.into_iter().filter_map(|r| r.err()) {
                    warn!(error = %err, "close failed after copy error");
                }
                warn!(error = %e, table = %job.table, "copy job failed");
                return Err(e);
            }
        };

        let report = CopyReport {
            rows,
            elapsed: started.elapsed(),
        };
        info!(
            table = %job.table,
            rows = report.rows,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "copy job finished"
        );
        Ok(report)
    }

    async fn execute(
        &self,
        source: &mut dyn Driver,
        destination: &mut dyn Driver,
        job: &CopyJob,
    ) -> Result<u64> {
        source.open().await?;
        destination.open().await?;
        transfer(
            source,
            destination,
            &job.query,
            &job.table,
            self.options.pipe_capacity,
        )
        .await
    }
}

/// Stream `query` from an open `source` into `table` on an open
/// `destination` through a pipe of `capacity` bytes.
///
/// Producer and consumer run concurrently; the first failure cancels the
/// other side. Returns the number of rows the source emitted.
pub async fn transfer(
    source: &mut dyn Driver,
    destination: &mut dyn Driver,
    query: &str,
    table: &str,
    capacity: usize,
) -> Result<u64> {
    let (mut writer, reader) = pipe(capacity);

    let producer = async move {
        let rows = source.copy_to(&mut writer, query).await?;
        writer
            .finish()
            .await
            .map_err(|e| CopySqlError::copy(source.name(), CopyPhase::WriteOutput, e))?;
        debug!(backend = %source.name(), rows, "source stream complete");
        Ok::<_, CopySqlError>(rows)
    };
    let consumer = async move {
        destination.copy_from(Box::new(reader), table).await?;
        debug!(backend = %destination.name(), table, "destination load complete");
        Ok::<_, CopySqlError>(())
    };

    let (rows, ()) = tokio::try_join!(producer, consumer)?;
    Ok(rows)
}
