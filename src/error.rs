//! Error types for the acquisition pipeline.
//!
//! One enum covers every failure mode the library surfaces. Transient bus
//! faults are normally contained inside the task that observed them and only
//! reach this type when a caller performs a bus operation directly.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A bus transaction against one device failed.
    #[error("Bus I/O with device {address:#04x} failed: {source}")]
    Bus {
        /// Address the transaction targeted.
        address: u8,
        /// Underlying transport error.
        #[source]
        source: std::io::Error,
    },

    /// A configured sensor did not answer its configuration writes.
    #[error("Sensor {address:#04x} did not respond during configuration: {message}")]
    SensorProbe {
        /// Address of the unresponsive sensor.
        address: u8,
        /// Description of the failed probe.
        message: String,
    },

    /// Configuration failed semantic validation.
    #[error("Invalid configuration: {message}")]
    Config {
        /// What was rejected and why.
        message: String,
    },

    /// The log file could not be created, written, or finalized.
    #[error("Log storage failure on '{path}': {source}")]
    Storage {
        /// Path of the affected file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A log row could not be serialized.
    #[error("Log row write failed: {0}")]
    Row(#[from] csv::Error),

    /// A task thread could not be spawned or joined.
    #[error("Task lifecycle failure in {task}: {message}")]
    Lifecycle {
        /// Name of the affected task.
        task: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Shorthand for a configuration validation failure.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a transient bus I/O error.
    pub fn is_bus(&self) -> bool {
        matches!(self, Self::Bus { .. })
    }

    /// Check if this failure was detected at configuration time.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::SensorProbe { .. })
    }

    /// Check if this is a log storage failure.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Row(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Bus {
            address: 0x68,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "no ack"),
        };
        assert!(err.to_string().contains("0x68"));
        assert!(err.to_string().contains("no ack"));
    }

    #[test]
    fn test_probe_display_carries_address() {
        let err = Error::SensorProbe {
            address: 0x6f,
            message: "write rejected".into(),
        };
        assert!(err.to_string().contains("0x6f"));
    }

    #[test]
    fn test_classification() {
        let bus = Error::Bus {
            address: 0x69,
            source: std::io::Error::new(std::io::ErrorKind::Other, "nack"),
        };
        assert!(bus.is_bus());
        assert!(!bus.is_config());

        let cfg = Error::config("sample period too short");
        assert!(cfg.is_config());
        assert!(!cfg.is_storage());

        let storage = Error::Storage {
            path: "/tmp/t.csv".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(storage.is_storage());
    }
}
