//! Pipeline lifecycle: create, start, pause, resume, teardown, regenerate.
//!
//! The framework owns everything the tasks share: the bus handle, every
//! data queue and mailbox, and the task join handles. The UI layer above it
//! only ever calls the lifecycle operations and reads display handles.
//!
//! Teardown is the delicate part. The merge task blocks on queue reads that
//! only producers can satisfy, so the shutdown order is fixed: drain, then
//! unblock the merge with sentinels and quit it, then the displays, then
//! the producers, and the trigger last. Reordering this can leave the merge
//! task parked forever.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::mpsc::{self, Sender};
use tracing::{debug, info, warn};

use crate::acquisition;
use crate::bus::{I2cBus, SharedBus};
use crate::config::Settings;
use crate::control::{Control, TaskHandle};
use crate::display::{self, DisplayHandle};
use crate::error::{Error, Result};
use crate::sensor::{Sample, SensorDevice};
use crate::storage::{self, LogSink};
use crate::trigger;

/// Per-sensor log queue capacity.
pub const LOG_QUEUE_CAPACITY: usize = 100;
/// Trigger-tick queue capacity.
pub const TICK_QUEUE_CAPACITY: usize = 100;
/// Per-sensor display queue capacity.
pub const DISPLAY_QUEUE_CAPACITY: usize = 1000;

/// Poll interval of the teardown drain wait.
const DRAIN_POLL: Duration = Duration::from_millis(50);
/// Grace period after halting a display feed, long enough for an in-flight
/// drain cycle to finish.
const DISPLAY_SETTLE: Duration = Duration::from_millis(100);

/// How long teardown waits for the data queues to empty before giving up
/// and proceeding: queues can stay non-empty forever when a producer died
/// or a consumer is halted, and teardown must terminate anyway.
fn drain_patience(period: Duration) -> Duration {
    (period * 2).clamp(Duration::from_secs(1), Duration::from_secs(5))
}

/// Everything a created pipeline owns, torn down as a unit.
struct Pipeline {
    addresses: Vec<u8>,
    log_txs: Vec<Sender<Sample>>,
    display_txs: Vec<Sender<Sample>>,
    tick_tx: Sender<DateTime<Local>>,
    acquisitions: Vec<TaskHandle>,
    displays: Vec<TaskHandle>,
    display_handles: Vec<DisplayHandle>,
    merge: TaskHandle,
    trigger: TaskHandle,
    log_path: PathBuf,
}

/// Owns the sensor configuration, the shared bus, and the running pipeline.
pub struct Framework {
    settings: Settings,
    bus: SharedBus,
    pipeline: Option<Pipeline>,
}

impl Framework {
    /// Validates the settings and binds the bus backend. No tasks run yet.
    pub fn new(settings: Settings, backend: Box<dyn I2cBus>) -> Result<Self> {
        settings.validate().map_err(Error::config)?;
        Ok(Self {
            settings,
            bus: SharedBus::new(backend),
            pipeline: None,
        })
    }

    /// Probes the sensors, opens the log file, and spawns all tasks halted.
    ///
    /// Every sensor is forced into one-shot mode first; a sensor that does
    /// not acknowledge is a configuration failure and nothing is spawned.
    /// The initialization broadcast and its settle delay happen before the
    /// acquisition tasks start, so each task's warm-up finds exactly one
    /// unread garbage conversion to discard.
    pub fn create(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(Error::Lifecycle {
                task: "framework",
                message: "pipeline already created".to_string(),
            });
        }
        let start = Local::now();
        let period = self.settings.sample_period();

        let mut devices = Vec::new();
        for sensor in self.settings.enabled_sensors() {
            let mode = sensor.conversion_mode().ok_or_else(|| {
                Error::config(format!("channel {} has no valid mode", sensor.channel))
            })?;
            let (slope, intercept) = sensor.calibration(mode);
            let mut device =
                SensorDevice::new(self.bus.clone(), sensor.address(), mode, slope, intercept);
            device
                .configure()
                .and_then(|()| device.stop_continuous())
                .map_err(|err| Error::SensorProbe {
                    address: sensor.address(),
                    message: err.to_string(),
                })?;
            devices.push(device);
        }
        let addresses: Vec<u8> = devices.iter().map(SensorDevice::address).collect();

        // Flush the power-on state: one synchronous conversion on every
        // device, complete before any task observes the bus.
        self.bus.broadcast_trigger()?;
        thread::sleep(trigger::SETTLE);

        let (tick_tx, tick_rx) = mpsc::channel(TICK_QUEUE_CAPACITY);
        let mut log_txs = Vec::with_capacity(devices.len());
        let mut log_rxs = Vec::with_capacity(devices.len());
        let mut display_txs = Vec::with_capacity(devices.len());
        let mut display_rxs = Vec::with_capacity(devices.len());
        for _ in &devices {
            let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
            let (display_tx, display_rx) = mpsc::channel(DISPLAY_QUEUE_CAPACITY);
            log_txs.push(log_tx);
            log_rxs.push(log_rx);
            display_txs.push(display_tx);
            display_rxs.push(display_rx);
        }

        let sink = LogSink::create(
            &self.settings.log.directory,
            &self.settings.log.file_prefix,
            self.settings.log.sample_period_s,
            &addresses,
            start,
        )?;
        let log_path = sink.path().to_path_buf();

        let merge = storage::spawn(sink, tick_rx, log_rxs, period)?;
        let mut displays = Vec::with_capacity(devices.len());
        let mut display_handles = Vec::with_capacity(devices.len());
        for (address, display_rx) in addresses.iter().zip(display_rxs) {
            let (task, handle) =
                display::spawn(*address, self.settings.display.history_capacity, display_rx)?;
            displays.push(task);
            display_handles.push(handle);
        }
        let mut acquisitions = Vec::with_capacity(devices.len());
        for (device, (log_tx, display_tx)) in devices
            .into_iter()
            .zip(log_txs.iter().zip(display_txs.iter()))
        {
            acquisitions.push(acquisition::spawn(
                device,
                log_tx.clone(),
                display_tx.clone(),
            )?);
        }
        let trigger = trigger::spawn(self.bus.clone(), period, tick_tx.clone())?;

        info!(
            "Pipeline created: {} sensors, period {:?}, log '{}'",
            addresses.len(),
            period,
            log_path.display()
        );
        self.pipeline = Some(Pipeline {
            addresses,
            log_txs,
            display_txs,
            tick_tx,
            acquisitions,
            displays,
            display_handles,
            merge,
            trigger,
            log_path,
        });
        Ok(())
    }

    /// Starts sampling: every task leaves halt, consumers first and the
    /// trigger last so the first tick finds everyone listening.
    pub fn start(&self) -> Result<()> {
        self.broadcast(Control::Run)
    }

    /// Halts every task; queued data stays queued.
    pub fn pause(&self) -> Result<()> {
        self.broadcast(Control::Halt)
    }

    /// Resumes after [`pause`](Self::pause).
    pub fn resume(&self) -> Result<()> {
        self.broadcast(Control::Run)
    }

    /// Halts only the display feeds; acquisition and logging continue.
    /// Used while the UI rebuilds itself.
    pub fn pause_display_only(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        for task in &pipeline.displays {
            task.signal(Control::Halt);
        }
        thread::sleep(DISPLAY_SETTLE);
        Ok(())
    }

    /// Resumes the display feeds after [`pause_display_only`](Self::pause_display_only).
    pub fn resume_display_only(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        for task in &pipeline.displays {
            task.signal(Control::Run);
        }
        Ok(())
    }

    /// Stops and joins every task, then drops all queues. Safe to call on an
    /// already-torn-down framework. Never returns with a task still alive.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        info!("Tearing down pipeline");
        let period = self.settings.sample_period();

        // Wait for the in-flight rows to land so no real data is discarded
        // as a control row. Bounded: a halted consumer or a dead producer
        // can keep a queue non-empty forever.
        let patience = drain_patience(period);
        let deadline = Instant::now() + patience;
        loop {
            let drained = pipeline.tick_tx.capacity() == pipeline.tick_tx.max_capacity()
                && pipeline
                    .log_txs
                    .iter()
                    .all(|tx| tx.capacity() == tx.max_capacity());
            if drained {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Data queues still backed up after {:?}, proceeding with teardown",
                    patience
                );
                break;
            }
            thread::sleep(DRAIN_POLL);
        }

        let mut failures: Vec<String> = Vec::new();

        // Quit goes into the merge mailbox before the unblocking pushes:
        // the merge task discards the sentinel row it assembles from them,
        // then reads the quit on its next mailbox poll.
        pipeline.merge.signal(Control::Quit);
        for tx in &pipeline.log_txs {
            if tx.try_send(Sample::SENTINEL).is_err() {
                debug!("Log queue closed or full during sentinel push");
            }
        }
        if pipeline.tick_tx.try_send(Local::now()).is_err() {
            debug!("Tick queue closed or full during sentinel push");
        }
        Self::join_into(pipeline.merge, &mut failures);

        // Displays: quit first, then a marker push to satisfy a drain in
        // progress, then join.
        for task in &pipeline.displays {
            task.signal(Control::Quit);
        }
        for tx in &pipeline.display_txs {
            if tx.try_send(Sample::SENTINEL).is_err() {
                debug!("Display queue closed or full during marker push");
            }
        }
        for task in pipeline.displays {
            Self::join_into(task, &mut failures);
        }

        // Acquisition tasks never block on reads. One could be parked in a
        // send against a full queue, but the merge and display receivers
        // are gone by now, so those sends fail immediately.
        for task in &pipeline.acquisitions {
            task.signal(Control::Quit);
        }
        for task in pipeline.acquisitions {
            Self::join_into(task, &mut failures);
        }

        pipeline.trigger.signal(Control::Quit);
        Self::join_into(pipeline.trigger, &mut failures);

        // Dropping the pipeline releases the queues and mailboxes.
        if failures.is_empty() {
            info!("Teardown complete");
            Ok(())
        } else {
            Err(Error::Lifecycle {
                task: "teardown",
                message: failures.join("; "),
            })
        }
    }

    /// Replaces the configuration: validate first, then teardown and create.
    /// On a validation error the running pipeline is left untouched.
    pub fn regenerate(&mut self, settings: Settings) -> Result<()> {
        settings.validate().map_err(Error::config)?;
        self.teardown()?;
        self.settings = settings;
        self.create()
    }

    /// Display handle for the sensor at `index` in configured order.
    pub fn display(&self, index: usize) -> Option<DisplayHandle> {
        self.pipeline
            .as_ref()
            .and_then(|p| p.display_handles.get(index).cloned())
    }

    /// Configured sensor addresses, in pipeline order.
    pub fn addresses(&self) -> Vec<u8> {
        self.pipeline
            .as_ref()
            .map_or_else(Vec::new, |p| p.addresses.clone())
    }

    /// Path of the current log file, if a pipeline exists.
    pub fn log_path(&self) -> Option<&Path> {
        self.pipeline.as_ref().map(|p| p.log_path.as_path())
    }

    /// Current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether a pipeline is currently created.
    pub fn is_created(&self) -> bool {
        self.pipeline.is_some()
    }

    fn pipeline(&self) -> Result<&Pipeline> {
        self.pipeline.as_ref().ok_or(Error::Lifecycle {
            task: "framework",
            message: "pipeline not created".to_string(),
        })
    }

    fn broadcast(&self, message: Control) -> Result<()> {
        let pipeline = self.pipeline()?;
        for task in &pipeline.acquisitions {
            task.signal(message);
        }
        for task in &pipeline.displays {
            task.signal(message);
        }
        pipeline.merge.signal(message);
        pipeline.trigger.signal(message);
        Ok(())
    }

    fn join_into(task: TaskHandle, failures: &mut Vec<String>) {
        if let Err(err) = task.join() {
            failures.push(err.to_string());
        }
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        if self.pipeline.is_some() {
            if let Err(err) = self.teardown() {
                warn!("Teardown during drop failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayConfig, LogConfig, SensorConfig};
    use crate::sim::{SimBus, SimProfile};

    fn settings_for(dir: &Path, channels: &[(u8, u8)]) -> Settings {
        Settings {
            log: LogConfig {
                directory: dir.to_path_buf(),
                file_prefix: "test".to_string(),
                sample_period_s: 0.5,
            },
            display: DisplayConfig::default(),
            sensors: channels
                .iter()
                .map(|&(channel, mode)| SensorConfig {
                    channel,
                    mode,
                    slope: None,
                    intercept: None,
                    enabled: true,
                })
                .collect(),
        }
    }

    #[test]
    fn test_drain_patience_bounds() {
        assert_eq!(drain_patience(Duration::from_millis(100)), Duration::from_secs(1));
        assert_eq!(drain_patience(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(drain_patience(Duration::from_secs(60)), Duration::from_secs(5));
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(dir.path(), &[(0, 3)]);
        settings.log.sample_period_s = 0.0001;
        let result = Framework::new(settings, Box::new(SimBus::new()));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_create_fails_on_absent_sensor() {
        let dir = tempfile::tempdir().unwrap();
        // Channel 2 configured but only channel 0 exists on the bus.
        let settings = settings_for(dir.path(), &[(0, 3), (2, 3)]);
        let sim = SimBus::new().with_sensor(0x68, SimProfile::Constant(1));
        let mut framework = Framework::new(settings, Box::new(sim)).unwrap();

        let err = framework.create().unwrap_err();
        assert!(matches!(err, Error::SensorProbe { address: 0x6A, .. }));
        assert!(!framework.is_created());
    }

    #[test]
    fn test_teardown_without_create_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path(), &[(0, 3)]);
        let sim = SimBus::new().with_sensor(0x68, SimProfile::Constant(1));
        let mut framework = Framework::new(settings, Box::new(sim)).unwrap();
        assert!(framework.teardown().is_ok());
        assert!(framework.teardown().is_ok());
    }

    #[test]
    fn test_lifecycle_calls_require_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path(), &[(0, 3)]);
        let sim = SimBus::new().with_sensor(0x68, SimProfile::Constant(1));
        let framework = Framework::new(settings, Box::new(sim)).unwrap();
        assert!(framework.start().is_err());
        assert!(framework.pause_display_only().is_err());
        assert!(framework.display(0).is_none());
        assert!(framework.log_path().is_none());
    }
}
