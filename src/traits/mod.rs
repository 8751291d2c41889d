mod driver;

pub use driver::{ByteSink, ByteSource, Driver};
