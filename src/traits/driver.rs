use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// CSV byte stream handed to [`Driver::copy_from`].
pub type ByteSource = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// CSV byte sink written by [`Driver::copy_to`].
pub type ByteSink = dyn AsyncWrite + Send + Unpin;

/// Trait for backend driver implementations.
///
/// A driver owns one backend connection (or cluster handle) and moves CSV in
/// and out of it. Lifecycle: constructed by a factory without any I/O, then
/// [`open`](Driver::open), then any number of copies, then
/// [`close`](Driver::close). Copies take `&mut self`, so one instance runs at
/// most one copy at a time.
///
/// Destination tables must already exist; drivers perform no schema checks
/// beyond what the backend itself does.
#[async_trait]
pub trait Driver: Send {
    /// Backend name, used to give errors and logs their context.
    fn name(&self) -> &str;

    /// Establish connectivity. Fails with a connection error when no
    /// configured host is reachable.
    async fn open(&mut self) -> Result<()>;

    /// Bulk-load the whole CSV `input` into `table` through the backend's
    /// native path. The input is streamed, never buffered in full, and the
    /// call succeeds only once the backend confirms the load.
    async fn copy_from(&mut self, input: ByteSource, table: &str) -> Result<()>;

    /// Run `query` and write its rows to `output` as CSV in result order,
    /// nulls as empty fields. Flushes `output` at the end and returns the
    /// number of rows written.
    async fn copy_to(&mut self, output: &mut ByteSink, query: &str) -> Result<u64>;

    /// Release the connection. A no-op when the driver was never opened.
    async fn close(&mut self) -> Result<()>;
}
