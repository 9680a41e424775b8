//! Per-tick records and the sinks they go to.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use safety::SensorSnapshot;
use serde::{Deserialize, Serialize};

use crate::actuator::PowerReadouts;

pub const CSV_HEADER: &str =
    "time, NTC, HUMI, TEMP, DEWPOINT, LV VOLT, LV CURR, PELT VOLT, PELT CURR, HV VOLT, HV CURR";

/// One log line. The schema is fixed for the whole run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub time: DateTime<Utc>,
    pub ntc_avg: f64,
    pub humidity_pct: f64,
    pub chuck_avg: f64,
    pub dewpoint_c: f64,
    pub lv_voltage: f64,
    pub lv_current: f64,
    pub pelt_voltage: f64,
    pub pelt_current: f64,
    pub hv_voltage: f64,
    pub hv_current: f64,
}

impl TickRecord {
    pub fn new(time: DateTime<Utc>, snapshot: &SensorSnapshot, power: &PowerReadouts) -> Self {
        Self {
            time,
            ntc_avg: snapshot.ntc_avg(),
            humidity_pct: snapshot.humidity_pct,
            chuck_avg: snapshot.chuck_avg(),
            dewpoint_c: snapshot.dewpoint(),
            lv_voltage: power.lv_voltage,
            lv_current: power.lv_current,
            pelt_voltage: power.pelt_voltage,
            pelt_current: power.pelt_current,
            hv_voltage: power.hv_voltage,
            hv_current: power.hv_current,
        }
    }

    pub fn csv_line(&self) -> String {
        format!(
            "{}, {:.2}, {:.2}, {:.2}, {:.2}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3e}",
            self.time.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.ntc_avg,
            self.humidity_pct,
            self.chuck_avg,
            self.dewpoint_c,
            self.lv_voltage,
            self.lv_current,
            self.pelt_voltage,
            self.pelt_current,
            self.hv_voltage,
            self.hv_current,
        )
    }
}

/// Where tick records go. Sink failures are reported but never stop a run.
pub trait TickSink: Send {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Append-only CSV file, flushed line by line.
pub struct CsvLog {
    path: PathBuf,
    out: LineWriter<File>,
}

impl CsvLog {
    pub fn file_name(started: DateTime<Local>) -> String {
        format!("{}_Interlock_log.csv", started.format("%Y%m%d_%H%M%S"))
    }

    /// Create a new timestamped log in `dir` and write the header.
    pub fn create(dir: &Path, started: DateTime<Local>) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(started));
        let mut out = LineWriter::new(File::create(&path)?);
        writeln!(out, "{CSV_HEADER}")?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TickSink for CsvLog {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        writeln!(self.out, "{}", rec.csv_line())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// One JSON object per line.
pub struct JsonlTrace<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonlTrace<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> TickSink for JsonlTrace<W> {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, rec)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Sends every record to each inner sink. The first error is returned after
/// all sinks have seen the record.
#[derive(Default)]
pub struct Fanout(pub Vec<Box<dyn TickSink>>);

impl TickSink for Fanout {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        let mut first = Ok(());
        for sink in &mut self.0 {
            if let Err(e) = sink.record(rec) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut first = Ok(());
        for sink in &mut self.0 {
            if let Err(e) = sink.flush() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

/// Keeps records in memory; clones share the buffer.
#[derive(Clone, Default)]
pub struct MemorySink(pub Arc<Mutex<Vec<TickRecord>>>);

impl MemorySink {
    pub fn records(&self) -> Vec<TickRecord> {
        match self.0.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TickSink for MemorySink {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut g) => g.push(rec.clone()),
            Err(poisoned) => poisoned.into_inner().push(rec.clone()),
        }
        Ok(())
    }
}
