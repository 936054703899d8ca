//! # Thermolog Core Library
//!
//! This crate is the core library for the `thermolog` application: concurrent
//! temperature acquisition from MCP342x delta-sigma converters sharing one
//! I²C bus. It owns the bus protocol, the per-sensor acquisition tasks, the
//! time-aligned CSV logging pipeline, and the display feeds a frontend reads
//! from. Organizing the project as a library keeps the same pipeline usable
//! from the command-line binary (`main.rs`) and from integration tests
//! running against the simulated bus.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: Per-sensor worker task; polls for the conversion
//!   ready edge and forwards exactly one sample per trigger.
//! - **`bus`**: The raw `I2cBus` trait and the mutex-guarded `SharedBus`
//!   handle every task transacts through.
//! - **`config`**: TOML + environment configuration loading and validation.
//!   See `config::Settings`.
//! - **`control`**: Run/halt/quit mailboxes and the `TaskHandle` owning a
//!   worker thread.
//! - **`display`**: Per-sensor history ring with repaint notification for a
//!   frontend.
//! - **`error`**: The crate-wide `Error` enum.
//! - **`framework`**: Lifecycle orchestration: create, start, pause, resume,
//!   teardown, regenerate.
//! - **`sensor`**: MCP342x conversion modes, configuration bytes, raw-value
//!   decoding, and the `SensorDevice` protocol driver.
//! - **`sim`**: In-memory bus backend with scriptable sensor behavior, for
//!   tests and the `--sim` run mode.
//! - **`storage`**: CSV log sink and the merge task assembling one row per
//!   trigger tick.
//! - **`telemetry`**: Logging setup.
//! - **`trigger`**: Global conversion trigger broadcasting on the sample
//!   period.

pub mod acquisition;
pub mod bus;
pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod framework;
pub mod sensor;
pub mod sim;
pub mod storage;
pub mod telemetry;
pub mod trigger;
