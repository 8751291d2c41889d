use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::codec::{CodecError, CsvRecords, CsvSink};
use crate::error::{CopyPhase, CopySqlError, Result};
use crate::registry::DriverFactory;
use crate::traits::{ByteSink, ByteSource, Driver};
use crate::types::{narrow, Parameters, Record};

pub const DRIVER_NAME: &str = "memory";

/// An operation observed by the store, for verification in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOperation {
    Open,
    CopyFrom { table: String, rows: usize },
    CopyTo { query: String, rows: u64 },
    Close,
}

struct Table {
    width: usize,
    rows: Vec<Record>,
}

struct StoreState {
    tables: HashMap<String, Table>,
    reachable: bool,
    fail_scan_after: Option<u64>,
    fail_close: bool,
    operations: Vec<RecordedOperation>,
}

/// Shared in-process backend holding named tables of fixed width.
///
/// Every driver created from the same store sees the same tables, the way
/// connections to one server would. Loads are all-or-nothing: a malformed
/// row or a width mismatch rejects the whole input.
///
/// # Example
/// ```
/// use copysql::drivers::MemoryStore;
///
/// let store = MemoryStore::new()
///     .with_table("users", 2)
///     .with_row("users", &[Some("1"), Some("Alice")]);
/// assert_eq!(store.rows("users").unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                tables: HashMap::new(),
                reachable: true,
                fail_scan_after: None,
                fail_close: false,
                operations: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty table with `width` columns, replacing any existing one.
    pub fn with_table(self, name: &str, width: usize) -> Self {
        self.create_table(name, width);
        self
    }

    /// Append a row to an existing table.
    pub fn with_row(self, table: &str, values: &[Option<&str>]) -> Self {
        self.insert_row(table, values);
        self
    }

    /// Append a row to `table`; ignored when the table does not exist.
    pub fn insert_row(&self, table: &str, values: &[Option<&str>]) {
        if let Some(table) = self.lock().tables.get_mut(table) {
            table
                .rows
                .push(values.iter().map(|v| v.map(str::to_string)).collect());
        }
    }

    pub fn create_table(&self, name: &str, width: usize) {
        self.lock().tables.insert(
            name.to_string(),
            Table {
                width,
                rows: Vec::new(),
            },
        );
    }

    /// Snapshot of a table's rows, or `None` if the table does not exist.
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        self.lock().tables.get(table).map(|t| t.rows.clone())
    }

    /// Make subsequent `open` calls fail as if the server were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make `copy_to` fail with a scan error after emitting `rows` rows.
    pub fn fail_scan_after(&self, rows: u64) {
        self.lock().fail_scan_after = Some(rows);
    }

    /// Make `close` release the driver but report an error.
    pub fn fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    /// Get all recorded operations in order.
    pub fn operations(&self) -> Vec<RecordedOperation> {
        self.lock().operations.clone()
    }

    /// Clear all recorded operations.
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    fn record(&self, operation: RecordedOperation) {
        self.lock().operations.push(operation);
    }

    /// Factory creating drivers bound to this store.
    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            store: self.clone(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The memory backend takes no connection settings; `database` is accepted
/// so the same parameter shape as other backends can be used.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MemoryParams {
    #[serde(default)]
    database: Option<String>,
}

pub struct MemoryFactory {
    store: MemoryStore,
}

impl DriverFactory for MemoryFactory {
    fn create(&self, parameters: &Parameters) -> Result<Box<dyn Driver>> {
        let params: MemoryParams = narrow(DRIVER_NAME, parameters)?;
        Ok(Box::new(MemoryDriver {
            store: self.store.clone(),
            database: params.database,
            open: false,
        }))
    }
}

/// Driver over a [`MemoryStore`].
pub struct MemoryDriver {
    store: MemoryStore,
    database: Option<String>,
    open: bool,
}

impl MemoryDriver {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            database: None,
            open: false,
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CopySqlError::connection(DRIVER_NAME, "driver is not open"))
        }
    }
}

/// Accepts a bare table name or `SELECT * FROM <table>`.
fn table_of(query: &str) -> &str {
    let query = query.trim().trim_end_matches(';').trim();
    const PREFIX: &str = "select * from ";
    match query.get(..PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PREFIX) => query[PREFIX.len()..].trim(),
        _ => query,
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    async fn open(&mut self) -> Result<()> {
        if !self.store.lock().reachable {
            return Err(CopySqlError::connection(DRIVER_NAME, "server unreachable"));
        }
        self.open = true;
        self.store.record(RecordedOperation::Open);
        Ok(())
    }

    async fn copy_from(&mut self, input: ByteSource, table: &str) -> Result<()> {
        self.ensure_open()?;
        let width = self
            .store
            .lock()
            .tables
            .get(table)
            .map(|t| t.width)
            .ok_or_else(|| {
                CopySqlError::copy(
                    DRIVER_NAME,
                    CopyPhase::ExecuteLoad,
                    format!("table {} does not exist", table),
                )
            })?;

        // Decode on a blocking thread; rows are staged there and only
        // committed below, so a cancelled or failed load stores nothing.
        let reader = SyncIoBridge::new(input);
        let staged = tokio::task::spawn_blocking(move || {
            CsvRecords::new(reader)
                .with_width(width)
                .collect::<std::result::Result<Vec<Record>, CodecError>>()
        })
        .await
        .map_err(|e| CopySqlError::copy(DRIVER_NAME, CopyPhase::ExecuteLoad, e))?
        .map_err(|e| match e {
            CodecError::Io(io) => CopySqlError::copy(DRIVER_NAME, CopyPhase::ReadInput, io),
            rejected => CopySqlError::copy(
                DRIVER_NAME,
                CopyPhase::ExecuteLoad,
                format!("load aborted: {}", rejected),
            ),
        })?;

        let count = staged.len();
        {
            let mut state = self.store.lock();
            let target = state.tables.get_mut(table).ok_or_else(|| {
                CopySqlError::copy(
                    DRIVER_NAME,
                    CopyPhase::ExecuteLoad,
                    format!("table {} was dropped during load", table),
                )
            })?;
            target.rows.extend(staged);
            state.operations.push(RecordedOperation::CopyFrom {
                table: table.to_string(),
                rows: count,
            });
        }
        debug!(backend = DRIVER_NAME, table, rows = count, "load committed");
        Ok(())
    }

    async fn copy_to(&mut self, output: &mut ByteSink, query: &str) -> Result<u64> {
        self.ensure_open()?;
        let table = table_of(query);
        let (width, rows, fail_after) = {
            let state = self.store.lock();
            let source = state.tables.get(table).ok_or_else(|| {
                CopySqlError::copy(
                    DRIVER_NAME,
                    CopyPhase::ExecuteQuery,
                    format!("table {} does not exist", table),
                )
            })?;
            (source.width, source.rows.clone(), state.fail_scan_after)
        };

        let mut sink = CsvSink::new(output).with_width(width);
        for row in &rows {
            if fail_after == Some(sink.rows()) {
                return Err(CopySqlError::scan(
                    DRIVER_NAME,
                    sink.rows() + 1,
                    "simulated scan failure",
                ));
            }
            sink.write_record(row.iter().map(Option::as_deref))
                .await
                .map_err(|e| CopySqlError::from_sink(DRIVER_NAME, e))?;
        }
        let written = sink
            .finish()
            .await
            .map_err(|e| CopySqlError::from_sink(DRIVER_NAME, e))?;

        self.store.record(RecordedOperation::CopyTo {
            query: query.to_string(),
            rows: written,
        });
        Ok(written)
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.store.record(RecordedOperation::Close);
            if self.store.lock().fail_close {
                return Err(CopySqlError::close(DRIVER_NAME, "simulated close failure"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_records;

    fn record(fields: &[Option<&str>]) -> Record {
        fields.iter().map(|f| f.map(str::to_string)).collect()
    }

    async fn opened(store: &MemoryStore) -> MemoryDriver {
        let mut driver = MemoryDriver::new(store.clone());
        driver.open().await.unwrap();
        driver
    }

    #[test]
    fn test_table_of() {
        assert_eq!(table_of("users"), "users");
        assert_eq!(table_of("SELECT * FROM users;"), "users");
        assert_eq!(table_of("  select * from  events "), "events");
    }

    #[tokio::test]
    async fn test_load_then_export() {
        let store = MemoryStore::new().with_table("users", 2);
        let mut driver = opened(&store).await;

        driver
            .copy_from(Box::new(&b"1,a\n2,\n"[..]), "users")
            .await
            .unwrap();
        assert_eq!(
            store.rows("users").unwrap(),
            vec![record(&[Some("1"), Some("a")]), record(&[Some("2"), None])]
        );

        let mut output: Vec<u8> = Vec::new();
        let rows = driver
            .copy_to(&mut output, "SELECT * FROM users")
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(output, b"1,a\n2,\n");
    }

    #[tokio::test]
    async fn test_malformed_row_aborts_whole_load() {
        let store = MemoryStore::new().with_table("users", 2);
        let mut driver = opened(&store).await;

        let err = driver
            .copy_from(Box::new(&b"1,a\n2\n3,c\n"[..]), "users")
            .await
            .unwrap_err();
        match err {
            CopySqlError::Copy { phase, .. } => assert_eq!(phase, CopyPhase::ExecuteLoad),
            other => panic!("Expected Copy error, got {:?}", other),
        }
        assert!(store.rows("users").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = MemoryStore::new();
        let mut driver = opened(&store).await;
        let mut output: Vec<u8> = Vec::new();
        let err = driver.copy_to(&mut output, "missing").await.unwrap_err();
        assert!(matches!(
            err,
            CopySqlError::Copy {
                phase: CopyPhase::ExecuteQuery,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_open() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        let mut driver = MemoryDriver::new(store.clone());
        assert!(matches!(
            driver.open().await.unwrap_err(),
            CopySqlError::Connection { .. }
        ));
        driver.close().await.unwrap();
        assert!(store.operations().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_stops_export() {
        let store = MemoryStore::new()
            .with_table("t", 1)
            .with_row("t", &[Some("1")])
            .with_row("t", &[Some("2")])
            .with_row("t", &[Some("3")]);
        store.fail_scan_after(1);
        let mut driver = opened(&store).await;

        let mut output: Vec<u8> = Vec::new();
        let err = driver.copy_to(&mut output, "t").await.unwrap_err();
        assert!(matches!(err, CopySqlError::Scan { row: 2, .. }));
    }

    #[tokio::test]
    async fn test_operations_are_recorded() {
        let store = MemoryStore::new().with_table("t", 1);
        let mut driver = opened(&store).await;
        driver.copy_from(Box::new(&b"x\n"[..]), "t").await.unwrap();
        let mut output: Vec<u8> = Vec::new();
        driver.copy_to(&mut output, "t").await.unwrap();
        driver.close().await.unwrap();
        driver.close().await.unwrap();

        assert_eq!(
            store.operations(),
            vec![
                RecordedOperation::Open,
                RecordedOperation::CopyFrom {
                    table: "t".to_string(),
                    rows: 1
                },
                RecordedOperation::CopyTo {
                    query: "t".to_string(),
                    rows: 1
                },
                RecordedOperation::Close,
            ]
        );
        assert_eq!(decode_records(&output).unwrap(), vec![record(&[Some("x")])]);
    }

    #[test]
    fn test_factory_rejects_unknown_parameters() {
        let store = MemoryStore::new();
        let parameters: Parameters = [("address".to_string(), serde_json::json!("x"))]
            .into_iter()
            .collect();
        let err = store.factory().create(&parameters).err().unwrap();
        assert!(matches!(err, CopySqlError::Configuration { .. }));
    }
}
