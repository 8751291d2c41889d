mod params;

pub use params::{narrow, split_host_port, ConnectionParams, Parameters};

/// One row of the interchange stream. `None` is a null (empty CSV field).
pub type Record = Vec<Option<String>>;
