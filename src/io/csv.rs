/*!
# Streaming samples to CSV

Enable via the `csv` feature. Columns are `iteration`, `chain`, `temperature`,
`log_likelihood`, `log_posterior` and one `dim_<i>` column per parameter; the header is written
with the first record.
*/

use std::fs::File;
use std::io::Write;
use std::path::Path;

use csv::Writer;

use super::{SampleRecord, SampleSink};
use crate::error::SinkError;

/**
A [`SampleSink`] writing one CSV row per record.

# Examples

```rust
use pt_mcmc::io::csv::CsvSink;
use pt_mcmc::io::{SampleRecord, SampleSink};

let mut sink = CsvSink::from_writer(Vec::new());
let record = SampleRecord {
    iteration: 3,
    chain: 0,
    temperature: 1.0,
    params: vec![0.5, -1.0],
    log_likelihood: -0.6,
    log_posterior: -1.2,
};
sink.write(&record)?;
let bytes = sink.into_inner()?;
assert!(String::from_utf8(bytes)?.starts_with("iteration,chain,temperature"));
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub struct CsvSink<W: Write> {
    writer: Writer<W>,
    header_written: bool,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        Ok(Self::from_writer(File::create(path)?))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: Writer::from_writer(writer),
            header_written: false,
        }
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|err| SinkError::Io(err.into_error()))
    }
}

impl<W: Write + Send> SampleSink for CsvSink<W> {
    fn write(&mut self, record: &SampleRecord) -> Result<(), SinkError> {
        if !self.header_written {
            let mut header: Vec<String> = [
                "iteration",
                "chain",
                "temperature",
                "log_likelihood",
                "log_posterior",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            header.extend((0..record.params.len()).map(|i| format!("dim_{}", i)));
            self.writer.write_record(&header)?;
            self.header_written = true;
        }
        let mut row = vec![
            record.iteration.to_string(),
            record.chain.to_string(),
            record.temperature.to_string(),
            record.log_likelihood.to_string(),
            record.log_posterior.to_string(),
        ];
        row.extend(record.params.iter().map(|v| v.to_string()));
        self.writer.write_record(&row)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csv::Reader;
    use tempfile::NamedTempFile;

    fn record(iteration: usize, x: f64) -> SampleRecord {
        SampleRecord {
            iteration,
            chain: 0,
            temperature: 1.0,
            params: vec![x, 2.0 * x],
            log_likelihood: -x,
            log_posterior: -x - 1.0,
        }
    }

    #[test]
    fn writes_header_and_rows() {
        let file = NamedTempFile::new().expect("Could not create temp file");
        let mut sink = CsvSink::create(file.path()).unwrap();
        sink.write(&record(0, 1.5)).unwrap();
        sink.write(&record(1, 2.5)).unwrap();
        sink.flush().unwrap();

        let mut reader = Reader::from_path(file.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "iteration",
                "chain",
                "temperature",
                "log_likelihood",
                "log_posterior",
                "dim_0",
                "dim_1"
            ]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "1");
        assert_eq!(rows[1][6].parse::<f64>().unwrap(), 5.0);
    }
}
