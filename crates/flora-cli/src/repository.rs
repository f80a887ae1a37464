//! JSON-lines sink for readings.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use flora_core::{Error, HistoricalSensorReading, LiveSensorReading, ReadingRepository};
use serde::Serialize;

/// Writes one JSON document per reading.
pub struct JsonLinesRepository {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesRepository {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Append to `path`, creating it if needed.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(io::BufWriter::new(file))))
    }

    fn write_line<T: Serialize>(&self, kind: &str, reading: &T) -> flora_core::Result<()> {
        #[derive(Serialize)]
        struct Line<'a, T> {
            kind: &'a str,
            #[serde(flatten)]
            reading: &'a T,
        }

        let line = serde_json::to_string(&Line { kind, reading })
            .map_err(|e| Error::Repository(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| Error::Repository("output lock poisoned".into()))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl ReadingRepository for JsonLinesRepository {
    async fn save_live_reading(&self, reading: &LiveSensorReading) -> flora_core::Result<()> {
        self.write_line("live", reading)
    }

    async fn save_historical_reading(
        &self,
        reading: &HistoricalSensorReading,
    ) -> flora_core::Result<()> {
        self.write_line("history", reading)
    }
}
