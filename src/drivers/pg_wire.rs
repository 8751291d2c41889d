use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{pin_mut, SinkExt, StreamExt, TryStreamExt};
use tokio_postgres::{Client, Config, CopyInSink, NoTls, SimpleQueryMessage};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::codec::{CsvSink, CHUNK_SIZE};
use crate::error::{CopyPhase, CopySqlError, Result};
use crate::traits::{ByteSink, ByteSource, Driver};
use crate::types::{split_host_port, ConnectionParams, Parameters};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const APPLICATION_NAME: &str = "copysql";

/// Backends reached over the PostgreSQL frontend/backend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Vertica,
    Postgres,
}

impl Flavor {
    pub fn name(self) -> &'static str {
        match self {
            Flavor::Vertica => "vertica",
            Flavor::Postgres => "postgres",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Flavor::Vertica => 5433,
            Flavor::Postgres => 5432,
        }
    }

    /// Bulk-load statement reading CSV from the client. Both commands abort
    /// the whole load on the first rejected row.
    pub fn copy_command(self, table: &str) -> String {
        match self {
            Flavor::Vertica => format!("COPY {} FROM STDIN DELIMITER ',' ABORT ON ERROR", table),
            Flavor::Postgres => format!("COPY {} FROM STDIN WITH (FORMAT csv)", table),
        }
    }
}

/// Driver for Vertica and PostgreSQL using tokio-postgres.
///
/// Loads go through a COPY-in context fed chunk by chunk from the input
/// stream. Exports use the simple-query protocol so every column arrives in
/// its text form, with the column count taken from the row description.
/// TLS is not negotiated.
pub struct PgWireDriver {
    flavor: Flavor,
    config: Config,
    client: Option<Client>,
}

impl PgWireDriver {
    pub fn new(flavor: Flavor, params: ConnectionParams) -> Result<Self> {
        let (host, port) = split_host_port(flavor.name(), &params.address, flavor.default_port())?;

        let mut config = Config::new();
        config
            .host(host.as_str())
            .port(port)
            .user(params.username.as_str())
            .dbname(params.database.as_str())
            .application_name(APPLICATION_NAME)
            .connect_timeout(CONNECT_TIMEOUT);
        if !params.password.is_empty() {
            config.password(params.password.as_str());
        }

        Ok(Self {
            flavor,
            config,
            client: None,
        })
    }

    pub fn from_parameters(flavor: Flavor, parameters: &Parameters) -> Result<Self> {
        Self::new(flavor, ConnectionParams::from_parameters(flavor.name(), parameters)?)
    }

    /// Factory registered under `vertica`.
    pub fn vertica(parameters: &Parameters) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Self::from_parameters(Flavor::Vertica, parameters)?))
    }

    /// Factory registered under `postgres`.
    pub fn postgres(parameters: &Parameters) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Self::from_parameters(Flavor::Postgres, parameters)?))
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CopySqlError::connection(self.flavor.name(), "driver is not open"))
    }
}

#[async_trait]
impl Driver for PgWireDriver {
    fn name(&self) -> &str {
        self.flavor.name()
    }

    async fn open(&mut self) -> Result<()> {
        let name = self.flavor.name();
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| CopySqlError::connection(name, e))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(backend = name, error = %e, "connection error");
            }
        });

        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| CopySqlError::connection(name, e))?;

        info!(backend = name, "connected");
        self.client = Some(client);
        Ok(())
    }

    async fn copy_from(&mut self, input: ByteSource, table: &str) -> Result<()> {
        let name = self.flavor.name();
        let statement = self.flavor.copy_command(table);
        let client = self.client()?;

        debug!(backend = name, table, "starting COPY");
        let sink: CopyInSink<Bytes> = client
            .copy_in(statement.as_str())
            .await
            .map_err(|e| CopySqlError::copy(name, CopyPhase::ExecuteLoad, e))?;
        pin_mut!(sink);

        // Returning early drops the sink unfinished, which aborts the COPY.
        let mut chunks = ReaderStream::with_capacity(input, CHUNK_SIZE);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| CopySqlError::copy(name, CopyPhase::ReadInput, e))?;
            sink.send(chunk)
                .await
                .map_err(|e| CopySqlError::copy(name, CopyPhase::ExecuteLoad, e))?;
        }

        let rows = sink
            .finish()
            .await
            .map_err(|e| CopySqlError::copy(name, CopyPhase::ExecuteLoad, e))?;
        info!(backend = name, table, rows, "bulk load complete");
        Ok(())
    }

    async fn copy_to(&mut self, output: &mut ByteSink, query: &str) -> Result<u64> {
        let name = self.flavor.name();
        let client = self.client()?;

        let stream = client
            .simple_query_raw(query)
            .await
            .map_err(|e| CopySqlError::copy(name, CopyPhase::ExecuteQuery, e))?;
        pin_mut!(stream);

        let mut sink = CsvSink::new(output);
        while let Some(message) = stream
            .try_next()
            .await
            .map_err(|e| CopySqlError::copy(name, CopyPhase::ExecuteQuery, e))?
        {
            let row = match message {
                // Fixes the width before any row arrives, so empty results
                // are checked too. A later statement may not change it.
                SimpleQueryMessage::RowDescription(columns) => {
                    match sink.width() {
                        None => sink = sink.with_width(columns.len()),
                        Some(width) if width != columns.len() => {
                            return Err(CopySqlError::scan(
                                name,
                                sink.rows() + 1,
                                format!(
                                    "result set has {} column(s), expected {}",
                                    columns.len(),
                                    width
                                ),
                            ));
                        }
                        Some(_) => {}
                    }
                    continue;
                }
                SimpleQueryMessage::Row(row) => row,
                _ => continue,
            };

            let row_number = sink.rows() + 1;
            let fields = (0..row.len())
                .map(|index| row.try_get(index))
                .collect::<std::result::Result<Vec<Option<&str>>, _>>()
                .map_err(|e| CopySqlError::scan(name, row_number, e))?;
            sink.write_record(fields)
                .await
                .map_err(|e| CopySqlError::from_sink(name, e))?;
        }

        let rows = sink
            .finish()
            .await
            .map_err(|e| CopySqlError::from_sink(name, e))?;
        debug!(backend = name, rows, "query stream complete");
        Ok(rows)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the client ends the spawned connection task.
        if self.client.take().is_some() {
            debug!(backend = self.flavor.name(), "connection released");
        }
        Ok(())
    }
}
