//! Log file sink and the merge task that feeds it.
//!
//! The merge task is paced by the trigger-tick queue: one blocking tick take,
//! then exactly one blocking sample take per configured sensor, then one CSV
//! row. That pairing is what turns independently-paced producers into "one
//! row per tick" — a slow sensor delays its row but can never misalign it.
//!
//! The file starts with fixed-width header lines written directly to the
//! [`File`]; the `End time:` line is a placeholder whose byte offset is
//! remembered so a graceful quit can seek back and overwrite it in place.
//! Data rows go through a [`csv::Writer`] built over the same file handle.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info};

use crate::control::{self, Control, ControlReceiver, TaskHandle};
use crate::error::{Error, Result};
use crate::sensor::Sample;

/// Data row timestamp format, millisecond precision.
pub const ROW_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.3f";
/// Header timestamp format; always 19 bytes, which keeps the `End time:`
/// overwrite offset stable.
pub const HEADER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Timestamp appended to the file name.
const FILE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
/// Same byte width as a formatted header timestamp.
const END_TIME_PLACEHOLDER: &str = "-------------------";

/// Open log file plus the bookkeeping needed to finalize it.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    end_time_offset: u64,
}

impl LogSink {
    /// Creates `<prefix><YYYYmmddHHMMSS>.csv` under `directory` and writes
    /// the headers and the column row.
    pub fn create(
        directory: &Path,
        prefix: &str,
        period_s: f64,
        addresses: &[u8],
        start: DateTime<Local>,
    ) -> Result<Self> {
        if !directory.exists() {
            std::fs::create_dir_all(directory).map_err(|source| Error::Storage {
                path: directory.display().to_string(),
                source,
            })?;
        }
        let file_name = format!("{prefix}{}.csv", start.format(FILE_STAMP_FORMAT));
        let path = directory.join(&file_name);
        let mut file = File::create(&path).map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;

        let mut offset = 0u64;
        let mut put = |file: &mut File, line: String| -> Result<u64> {
            file.write_all(line.as_bytes())
                .map_err(|source| Error::Storage {
                    path: path.display().to_string(),
                    source,
                })?;
            let at = offset;
            offset += line.len() as u64;
            Ok(at)
        };

        put(&mut file, format!("Filename: {file_name}\n"))?;
        put(
            &mut file,
            format!("Start time: {}\n", start.format(HEADER_TIME_FORMAT)),
        )?;
        let line_start = put(&mut file, format!("End time: {END_TIME_PLACEHOLDER}\n"))?;
        let end_time_offset = line_start + "End time: ".len() as u64;
        put(&mut file, format!("Sample period: {period_s} s\n"))?;

        let mut writer = csv::Writer::from_writer(file);
        let mut columns = vec!["time".to_string()];
        for address in addresses {
            columns.push(format!("addr_{address:#04x}"));
            columns.push(format!("raw_{address:#04x}"));
            columns.push(format!("cooked_{address:#04x}"));
        }
        writer.write_record(&columns)?;
        writer.flush().map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?;

        info!("Log file started at '{}'", path.display());
        Ok(Self {
            path,
            writer,
            end_time_offset,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one data row and flushes it to disk.
    pub fn write_row(&mut self, stamp: DateTime<Local>, samples: &[Sample]) -> Result<()> {
        let mut record = Vec::with_capacity(1 + samples.len() * 3);
        record.push(stamp.format(ROW_TIME_FORMAT).to_string());
        for sample in samples {
            record.push(format!("{:#04x}", sample.address));
            record.push(sample.raw.to_string());
            record.push(format!("{:.6}", sample.cooked));
        }
        self.writer.write_record(&record)?;
        self.writer.flush().map_err(|source| Error::Storage {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Flushes, then seeks back and overwrites the end-time placeholder.
    pub fn finalize(mut self, end: DateTime<Local>) -> Result<()> {
        let storage_err = |path: &Path, source: std::io::Error| Error::Storage {
            path: path.display().to_string(),
            source,
        };
        self.writer
            .flush()
            .map_err(|source| storage_err(&self.path, source))?;
        let mut file = self.writer.into_inner().map_err(|err| {
            let source = std::io::Error::new(err.error().kind(), err.to_string());
            Error::Storage {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        file.seek(SeekFrom::Start(self.end_time_offset))
            .map_err(|source| storage_err(&self.path, source))?;
        file.write_all(end.format(HEADER_TIME_FORMAT).to_string().as_bytes())
            .map_err(|source| storage_err(&self.path, source))?;
        file.flush()
            .map_err(|source| storage_err(&self.path, source))?;
        info!("Log file '{}' finalized", self.path.display());
        Ok(())
    }
}

/// Spawns the merge thread; it starts halted.
///
/// `sample_rxs` must be in configured sensor order; that order fixes the
/// column layout of every row.
pub fn spawn(
    sink: LogSink,
    tick_rx: Receiver<DateTime<Local>>,
    sample_rxs: Vec<Receiver<Sample>>,
    period: Duration,
) -> Result<TaskHandle> {
    let (mailbox, commands) = control::mailbox();
    let join = thread::Builder::new()
        .name("log-merge".into())
        .spawn(move || run(sink, commands, tick_rx, sample_rxs, period))
        .map_err(|err| Error::Lifecycle {
            task: "log-merge",
            message: err.to_string(),
        })?;
    Ok(TaskHandle::new("log-merge", mailbox, join))
}

fn run(
    mut sink: LogSink,
    mut commands: ControlReceiver,
    mut tick_rx: Receiver<DateTime<Local>>,
    mut sample_rxs: Vec<Receiver<Sample>>,
    period: Duration,
) {
    info!("Log merge task started ({} sensors)", sample_rxs.len());
    let mut running = false;

    loop {
        match control::poll(&mut commands) {
            Some(Control::Run) => running = true,
            Some(Control::Halt) => running = false,
            Some(Control::Quit) => break,
            None => {}
        }
        if !running {
            // Queued data stays put across halt/resume; nothing is drained.
            thread::sleep(period);
            continue;
        }

        // One row attempt per trigger tick.
        let Some(stamp) = tick_rx.blocking_recv() else {
            break;
        };
        let mut row = Vec::with_capacity(sample_rxs.len());
        let mut discard = false;
        for rx in &mut sample_rxs {
            match rx.blocking_recv() {
                Some(sample) => {
                    // One sentinel poisons the whole row; keep taking from
                    // the remaining queues so per-sensor pairing stays intact.
                    discard |= sample.is_sentinel();
                    row.push(sample);
                }
                None => discard = true,
            }
        }
        if discard {
            debug!("Discarded control row");
            continue;
        }
        if let Err(err) = sink.write_row(stamp, &row) {
            error!("Log write failed, merge task exiting: {}", err);
            return;
        }
    }

    if let Err(err) = sink.finalize(Local::now()) {
        error!("Failed to finalize log file: {}", err);
    }
    info!("Log merge task stopped");
}
