//! CSV interchange codec.
//!
//! Rows are sequences of nullable text fields. Encoding follows RFC 4180:
//! comma delimiter, no header row, `\n` line terminator, fields containing a
//! comma, quote or line break are quoted and embedded quotes are doubled. A
//! null encodes as an empty field and an empty field decodes as null.

use std::io;

use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::types::Record;

/// Encoded bytes buffered by [`CsvSink`] before they are written out.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Error raised while encoding or decoding CSV.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed CSV: {0}")]
    Csv(csv::Error),

    #[error("row {row} has {actual} column(s), expected {expected}")]
    ColumnCount {
        row: u64,
        expected: usize,
        actual: usize,
    },
}

impl From<csv::Error> for CodecError {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Io(io) => CodecError::Io(io::Error::new(io.kind(), io.to_string())),
            _ => CodecError::Csv(err),
        }
    }
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(CHUNK_SIZE))
}

/// Incremental CSV encoder over an async byte sink.
///
/// Every record must have the same number of fields. The width is either set
/// up front with [`CsvSink::with_width`] or fixed by the first record.
pub struct CsvSink<'a, W: ?Sized> {
    output: &'a mut W,
    encoder: csv::Writer<Vec<u8>>,
    width: Option<usize>,
    rows: u64,
    chunk_size: usize,
}

impl<'a, W> CsvSink<'a, W>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    pub fn new(output: &'a mut W) -> Self {
        Self {
            output,
            encoder: csv_writer(),
            width: None,
            rows: 0,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Fix the column count before the first record arrives.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn width(&self) -> Option<usize> {
        self.width
    }

    /// Number of records written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Encode one record. `None` fields become empty fields.
    pub async fn write_record<I, F>(&mut self, fields: I) -> Result<(), CodecError>
    where
        I: IntoIterator<Item = Option<F>>,
        F: AsRef<[u8]>,
    {
        let fields: Vec<Option<F>> = fields.into_iter().collect();
        let row = self.rows + 1;
        let expected = *self.width.get_or_insert(fields.len());
        if fields.len() != expected {
            return Err(CodecError::ColumnCount {
                row,
                expected,
                actual: fields.len(),
            });
        }

        self.encoder.write_record(
            fields
                .iter()
                .map(|field| field.as_ref().map_or(&b""[..], |value| value.as_ref())),
        )?;
        self.rows = row;

        // Move the encoder's internal buffer into the chunk so its size is exact.
        self.encoder.flush()?;
        if self.encoder.get_ref().len() >= self.chunk_size {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<(), CodecError> {
        self.encoder.flush()?;
        if self.encoder.get_ref().is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.encoder, csv_writer())
            .into_inner()
            .map_err(|e| e.into_error())?;
        self.output.write_all(&chunk).await?;
        Ok(())
    }

    /// Write out buffered bytes, flush the sink and return the record count.
    pub async fn finish(mut self) -> Result<u64, CodecError> {
        self.flush_chunk().await?;
        self.output.flush().await?;
        Ok(self.rows)
    }
}

/// Incremental CSV decoder over a blocking reader.
///
/// Yields one [`Record`] per line. Decoding stops at the first error; a record
/// whose width differs from the first one (or from [`CsvRecords::with_width`])
/// is an error.
pub struct CsvRecords<R> {
    reader: csv::Reader<R>,
    record: StringRecord,
    width: Option<usize>,
    rows: u64,
    done: bool,
}

impl<R: io::Read> CsvRecords<R> {
    pub fn new(input: R) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        Self {
            reader,
            record: StringRecord::new(),
            width: None,
            rows: 0,
            done: false,
        }
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = Some(width);
        self
    }

    /// Number of records decoded so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl<R: io::Read> Iterator for CsvRecords<R> {
    type Item = Result<Record, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.reader.read_record(&mut self.record) {
            Ok(false) => {
                self.done = true;
                None
            }
            Ok(true) => {
                let row = self.rows + 1;
                let expected = *self.width.get_or_insert(self.record.len());
                if self.record.len() != expected {
                    self.done = true;
                    return Some(Err(CodecError::ColumnCount {
                        row,
                        expected,
                        actual: self.record.len(),
                    }));
                }
                self.rows = row;
                Some(Ok(self
                    .record
                    .iter()
                    .map(|field| (!field.is_empty()).then(|| field.to_string()))
                    .collect()))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}

/// Encode records into an in-memory CSV document.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = csv_writer();
    let mut width = None;
    for (index, record) in records.iter().enumerate() {
        let expected = *width.get_or_insert(record.len());
        if record.len() != expected {
            return Err(CodecError::ColumnCount {
                row: index as u64 + 1,
                expected,
                actual: record.len(),
            });
        }
        encoder.write_record(record.iter().map(|field| field.as_deref().unwrap_or("")))?;
    }
    Ok(encoder.into_inner().map_err(|e| e.into_error())?)
}

/// Decode an in-memory CSV document.
pub fn decode_records(input: &[u8]) -> Result<Vec<Record>, CodecError> {
    CsvRecords::new(input).collect()
}
