use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, TryStreamExt};
use reqwest::{Body, Client, RequestBuilder, Response, Url};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

use crate::codec::{CsvSink, CHUNK_SIZE};
use crate::error::{CopyPhase, CopySqlError, Result};
use crate::traits::{ByteSink, ByteSource, Driver};
use crate::types::{split_host_port, ConnectionParams, Parameters};

pub const DRIVER_NAME: &str = "clickhouse";

const DEFAULT_PORT: u16 = 8123;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const OUTPUT_FORMAT: &str = "TabSeparatedWithNames";

/// ClickHouse driver speaking the HTTP interface.
///
/// `address` may list several comma-separated hosts. [`Driver::open`] pings
/// all of them concurrently and uses the first reachable one in configured
/// order. Bulk loads forward the CSV stream untouched as the body of an
/// `INSERT INTO <table> FORMAT CSV` request. Query results are read as
/// `TabSeparatedWithNames`, so every value keeps ClickHouse's own text form
/// and arbitrary bytes pass through.
pub struct ClickHouseDriver {
    http: Client,
    hosts: Vec<Url>,
    username: String,
    password: String,
    database: String,
    active: Option<Url>,
}

impl ClickHouseDriver {
    pub fn new(params: ConnectionParams) -> Result<Self> {
        let hosts = params
            .address
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_host)
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(CopySqlError::configuration(DRIVER_NAME, "no hosts in `address`"));
        }

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| CopySqlError::configuration(DRIVER_NAME, e))?;

        Ok(Self {
            http,
            hosts,
            username: params.username,
            password: params.password,
            database: params.database,
            active: None,
        })
    }

    pub fn from_parameters(parameters: &Parameters) -> Result<Self> {
        Self::new(ConnectionParams::from_parameters(DRIVER_NAME, parameters)?)
    }

    /// Factory registered under [`DRIVER_NAME`].
    pub fn factory(parameters: &Parameters) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Self::from_parameters(parameters)?))
    }

    /// Configured hosts in order.
    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    /// Host selected by the last successful `open`.
    pub fn active_host(&self) -> Option<&Url> {
        self.active.as_ref()
    }

    fn active(&self) -> Result<&Url> {
        self.active
            .as_ref()
            .ok_or_else(|| CopySqlError::connection(DRIVER_NAME, "driver is not open"))
    }

    fn post(&self, host: &Url) -> RequestBuilder {
        self.http
            .post(host.clone())
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .query(&[("database", self.database.as_str())])
    }
}

/// Accepts `host[:port]` or a full `http(s)://` URL.
fn parse_host(entry: &str) -> Result<Url> {
    let raw = if entry.contains("://") {
        entry.to_string()
    } else {
        let (host, port) = split_host_port(DRIVER_NAME, entry, DEFAULT_PORT)?;
        if host.contains(':') {
            format!("http://[{}]:{}/", host, port)
        } else {
            format!("http://{}:{}/", host, port)
        }
    };

    let mut url = Url::parse(&raw).map_err(|e| {
        CopySqlError::configuration(DRIVER_NAME, format!("invalid host `{}`: {}", entry, e))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CopySqlError::configuration(
            DRIVER_NAME,
            format!("unsupported scheme in `{}`", entry),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(CopySqlError::configuration(
            DRIVER_NAME,
            format!("credentials in host `{}`; use username/password", url.host_str().unwrap_or(entry)),
        ));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

async fn ping(http: &Client, host: &Url) -> std::result::Result<(), String> {
    let url = host.join("ping").map_err(|e| e.to_string())?;
    let response = http
        .get(url)
        .timeout(PING_TIMEOUT)
        .send()
        .await
        .map_err(|e| describe(&e))?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", response.status().as_u16()))
    }
}

async fn ensure_success(response: Response, phase: CopyPhase) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await;
    Err(CopySqlError::copy(
        DRIVER_NAME,
        phase,
        status_message(status.as_u16(), body),
    ))
}

fn status_message<E: StdError>(status: u16, body: std::result::Result<String, E>) -> String {
    match body {
        Ok(text) => format!("HTTP {}: {}", status, text.trim()),
        Err(e) => format!("HTTP {}: <body unreadable: {}>", status, describe(&e)),
    }
}

/// Flatten an error and its sources into one line.
fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Split one `TabSeparated` line into unescaped fields. `\N` is null.
fn split_row(line: &[u8]) -> Vec<Option<Vec<u8>>> {
    line.split(|&b| b == b'\t').map(unescape_field).collect()
}

fn unescape_field(raw: &[u8]) -> Option<Vec<u8>> {
    if raw == b"\\N" {
        return None;
    }
    let mut field = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            field.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => field.push(b'\n'),
            Some(b't') => field.push(b'\t'),
            Some(b'r') => field.push(b'\r'),
            Some(b'b') => field.push(0x08),
            Some(b'f') => field.push(0x0c),
            Some(b'0') => field.push(0),
            Some(escaped) => field.push(escaped),
            None => field.push(b'\\'),
        }
    }
    Some(field)
}

/// ClickHouse reports a failure that happens after the first bytes were
/// sent by appending the exception text to an otherwise successful body.
/// Only consulted for lines that are not well-formed rows, since stored
/// values may quote exception text too.
fn server_exception(line: &[u8]) -> Option<String> {
    const MARKER: &[u8] = b"DB::Exception";
    line.windows(MARKER.len()).position(|w| w == MARKER)?;
    let start = line
        .windows(5)
        .position(|w| w == b"Code:")
        .unwrap_or(0);
    let text = String::from_utf8_lossy(&line[start..]);
    Some(text.chars().take(500).collect())
}

#[async_trait]
impl Driver for ClickHouseDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn open(&mut self) -> Result<()> {
        let probes = self.hosts.iter().map(|host| ping(&self.http, host));
        let results = future::join_all(probes).await;

        self.active = None;
        for (host, result) in self.hosts.iter().zip(results) {
            match result {
                Ok(()) if self.active.is_none() => self.active = Some(host.clone()),
                Ok(()) => {}
                Err(e) => warn!(backend = DRIVER_NAME, host = %host, error = %e, "host unreachable"),
            }
        }

        let host = self
            .active
            .as_ref()
            .ok_or_else(|| CopySqlError::connection(DRIVER_NAME, "all clickhouse hosts down"))?;
        info!(backend = DRIVER_NAME, host = %host, "selected clickhouse host");
        Ok(())
    }

    async fn copy_from(&mut self, input: ByteSource, table: &str) -> Result<()> {
        let host = self.active()?;

        let read_failure: Arc<Mutex<Option<String>>> = Arc::default();
        let slot = Arc::clone(&read_failure);
        let chunks = ReaderStream::with_capacity(input, CHUNK_SIZE).inspect_err(move |e| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        });

        let statement = format!("INSERT INTO {} FORMAT CSV", table);
        debug!(backend = DRIVER_NAME, table, "forwarding CSV stream");

        let response = self
            .post(host)
            .query(&[("query", statement.as_str())])
            .body(Body::wrap_stream(chunks))
            .send()
            .await
            .map_err(|e| {
                let failed_read = read_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match failed_read {
                    Some(message) => CopySqlError::copy(DRIVER_NAME, CopyPhase::ReadInput, message),
                    None => CopySqlError::copy(DRIVER_NAME, CopyPhase::ExecuteLoad, describe(&e)),
                }
            })?;
        ensure_success(response, CopyPhase::ExecuteLoad).await?;

        info!(backend = DRIVER_NAME, table, "bulk load complete");
        Ok(())
    }

    async fn copy_to(&mut self, output: &mut ByteSink, query: &str) -> Result<u64> {
        let host = self.active()?;
        let response = self
            .post(host)
            .query(&[("default_format", OUTPUT_FORMAT)])
            .body(query.to_string())
            .send()
            .await
            .map_err(|e| CopySqlError::copy(DRIVER_NAME, CopyPhase::ExecuteQuery, describe(&e)))?;
        let response = ensure_success(response, CopyPhase::ExecuteQuery).await?;

        let mut body =
            StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
        let mut sink = CsvSink::new(output);
        let mut header_seen = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = body
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| CopySqlError::copy(DRIVER_NAME, CopyPhase::ExecuteQuery, e))?;
            if read == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }

            let fields = split_row(&line);
            // The first line carries the column names.
            if !header_seen {
                header_seen = true;
                sink = sink.with_width(fields.len());
                continue;
            }
            if sink.width() != Some(fields.len()) {
                if let Some(message) = server_exception(&line) {
                    return Err(CopySqlError::copy(
                        DRIVER_NAME,
                        CopyPhase::ExecuteQuery,
                        message,
                    ));
                }
            }
            sink.write_record(fields)
                .await
                .map_err(|e| CopySqlError::from_sink(DRIVER_NAME, e))?;
        }

        let rows = sink
            .finish()
            .await
            .map_err(|e| CopySqlError::from_sink(DRIVER_NAME, e))?;
        debug!(backend = DRIVER_NAME, rows, "query stream complete");
        Ok(rows)
    }

    async fn close(&mut self) -> Result<()> {
        self.active = None;
        Ok(())
    }
}
