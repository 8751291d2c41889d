pub mod clickhouse;
pub mod memory;
pub mod pg_wire;

pub use self::clickhouse::ClickHouseDriver;
pub use self::memory::{MemoryDriver, MemoryFactory, MemoryStore, RecordedOperation};
pub use self::pg_wire::{Flavor, PgWireDriver};
