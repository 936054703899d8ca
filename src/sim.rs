//! Simulated MCP342x device bank.
//!
//! Drop-in [`I2cBus`] backend used by tests and the `--sim` run mode.
//! Simulated behaviors:
//! - per-address configuration register with one-shot / continuous bits
//! - conversion timing derived from the configured mode's sample rate
//! - ready flagged only while the latch holds an unread conversion: reading
//!   the result marks it stale, and the flag clears again when the next
//!   conversion lands, exactly like the hardware's set-on-read bit
//! - general-call reset and convert reaching every device in one transaction
//! - sign-extended transmit encoding matching [`crate::sensor::decode_raw`]
//! - value profiles (constant, ramp, ambient drift with noise) and
//!   read/write fault injection
//!
//! The bank lives behind an `Arc`, so a clone kept by a test can inject
//! faults or inspect conversion counts while the pipeline owns the boxed
//! backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bus::{I2cBus, GC_CONVERT, GC_RESET, GENERAL_CALL};
use crate::sensor::ConversionMode;

/// Power-on configuration register: continuous 12-bit conversion.
pub const POWER_ON_CONFIG: u8 = 0x10;
/// Cold-start latch content before any conversion has run.
const POWER_ON_GARBAGE: i32 = 0x555;
/// Continuous-conversion bit of the configuration byte.
const CONTINUOUS_BIT: u8 = 0x10;
/// Trigger / not-ready bit.
const TRIGGER_BIT: u8 = 0x80;

/// Conversion value source for one simulated channel.
#[derive(Debug, Clone)]
pub enum SimProfile {
    /// Every conversion latches the same code.
    Constant(i32),
    /// Linearly stepping code, folded back into the mode's signed range.
    Ramp {
        /// First latched code.
        start: i32,
        /// Increment per conversion.
        step: i32,
    },
    /// Slow drift around room temperature with count noise, mapped through
    /// the current mode's factory calibration.
    Ambient {
        /// Seeded noise source, kept per channel for reproducibility.
        rng: StdRng,
    },
}

impl SimProfile {
    /// Ambient profile with a deterministic noise seed.
    pub fn ambient(seed: u64) -> Self {
        SimProfile::Ambient {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn next_raw(&mut self, conversions: u64, mode: &ConversionMode) -> i32 {
        let half = i64::from(mode.mask) + 1;
        let value = match self {
            SimProfile::Constant(code) => i64::from(*code),
            SimProfile::Ramp { start, step } => {
                let span = 2 * half;
                let linear = i64::from(*start) + i64::from(*step) * conversions as i64;
                (linear + half).rem_euclid(span) - half
            }
            SimProfile::Ambient { rng } => {
                let drift = 22.0 + 3.0 * ((conversions as f64) / 40.0).sin();
                let center = (drift - mode.default_intercept) / mode.default_slope;
                center as i64 + rng.gen_range(-4..=4)
            }
        };
        value.clamp(-half, half - 1) as i32
    }
}

/// One simulated device.
#[derive(Debug)]
struct Channel {
    config: u8,
    profile: SimProfile,
    latched: i32,
    busy_until: Option<Instant>,
    pending: bool,
    already_read: bool,
    conversions: u64,
    fail_reads: bool,
    fail_writes: bool,
}

impl Channel {
    fn new(profile: SimProfile) -> Self {
        Self {
            config: POWER_ON_CONFIG,
            profile,
            latched: POWER_ON_GARBAGE,
            busy_until: None,
            pending: false,
            already_read: false,
            conversions: 0,
            fail_reads: false,
            fail_writes: false,
        }
    }

    fn reset(&mut self) {
        self.config = POWER_ON_CONFIG;
        self.busy_until = None;
        self.pending = false;
        self.already_read = false;
        self.latched = POWER_ON_GARBAGE;
    }

    fn mode(&self) -> &'static ConversionMode {
        ConversionMode::from_config_byte(self.config)
    }

    fn continuous(&self) -> bool {
        self.config & CONTINUOUS_BIT != 0
    }

    fn trigger(&mut self, now: Instant) {
        self.busy_until = Some(now + self.mode().conversion_time());
        self.pending = true;
    }

    /// Advances simulated time: latches completed conversions and, in
    /// continuous mode, chains the next one. A fresh latch clears the
    /// read-marker, so the next status read reports ready again.
    fn settle(&mut self, now: Instant) {
        let step = self.mode().conversion_time();
        while let Some(done) = self.busy_until {
            if now < done {
                break;
            }
            if self.pending {
                self.conversions += 1;
                let mode = self.mode();
                self.latched = self.profile.next_raw(self.conversions, mode);
                self.already_read = false;
            }
            if self.continuous() {
                self.busy_until = Some(done + step);
                self.pending = true;
            } else {
                self.busy_until = None;
                self.pending = false;
            }
        }
    }

    /// Not-ready means "nothing unread in the latch": either the result was
    /// already read out, or a one-shot conversion is still in flight. The
    /// power-on garbage latch counts as unread data.
    fn busy(&self, now: Instant) -> bool {
        if self.already_read {
            return true;
        }
        !self.continuous() && self.pending && self.busy_until.is_some_and(|done| now < done)
    }

    fn transmit(&self, now: Instant, len: usize) -> Vec<u8> {
        let mode = self.mode();
        let data_len = mode.data_len();
        let span: u32 = match data_len {
            3 => 0x00FF_FFFF,
            _ => 0x0000_FFFF,
        };
        let wide = (self.latched as u32) & span;
        let status = (self.config & !TRIGGER_BIT) | if self.busy(now) { TRIGGER_BIT } else { 0 };
        let mut block = Vec::with_capacity(len);
        for i in (0..data_len).rev() {
            block.push((wide >> (8 * i)) as u8);
        }
        block.push(status);
        // The master clocks as many bytes as it likes; the device repeats
        // the configuration byte past the end of the data.
        block.resize(len.max(block.len()), status);
        block.truncate(len);
        block
    }
}

#[derive(Debug, Default)]
struct Bank {
    channels: BTreeMap<u8, Channel>,
}

/// Simulated bus backend holding up to eight channels.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    bank: Arc<Mutex<Bank>>,
}

impl SimBus {
    /// Empty bank; add channels with [`with_sensor`](Self::with_sensor) or
    /// [`add_sensor`](Self::add_sensor).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style channel registration.
    pub fn with_sensor(self, address: u8, profile: SimProfile) -> Self {
        self.add_sensor(address, profile);
        self
    }

    /// Registers a channel at `address`.
    pub fn add_sensor(&self, address: u8, profile: SimProfile) {
        self.bank
            .lock()
            .channels
            .insert(address, Channel::new(profile));
    }

    /// Makes reads from `address` fail until cleared.
    pub fn fail_reads(&self, address: u8, failing: bool) {
        if let Some(channel) = self.bank.lock().channels.get_mut(&address) {
            channel.fail_reads = failing;
        }
    }

    /// Makes writes to `address` fail until cleared.
    pub fn fail_writes(&self, address: u8, failing: bool) {
        if let Some(channel) = self.bank.lock().channels.get_mut(&address) {
            channel.fail_writes = failing;
        }
    }

    /// Completed conversions for `address`, advancing simulated time first.
    pub fn conversions(&self, address: u8) -> u64 {
        let now = Instant::now();
        let mut bank = self.bank.lock();
        bank.channels.get_mut(&address).map_or(0, |channel| {
            channel.settle(now);
            channel.conversions
        })
    }

    /// Current configuration register for `address`.
    pub fn config_byte(&self, address: u8) -> Option<u8> {
        self.bank
            .lock()
            .channels
            .get(&address)
            .map(|channel| channel.config)
    }

    fn no_device(address: u8) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no device at {address:#04x}"),
        )
    }
}

impl I2cBus for SimBus {
    fn write_byte(&mut self, address: u8, byte: u8) -> std::io::Result<()> {
        let now = Instant::now();
        let mut bank = self.bank.lock();
        if address == GENERAL_CALL {
            match byte {
                GC_RESET => {
                    for channel in bank.channels.values_mut() {
                        channel.reset();
                    }
                }
                GC_CONVERT => {
                    for channel in bank.channels.values_mut() {
                        channel.settle(now);
                        channel.trigger(now);
                    }
                }
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("unsupported general-call command {other:#04x}"),
                    ));
                }
            }
            return Ok(());
        }
        let channel = bank
            .channels
            .get_mut(&address)
            .ok_or_else(|| Self::no_device(address))?;
        if channel.fail_writes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected write fault",
            ));
        }
        channel.settle(now);
        channel.config = byte & !TRIGGER_BIT;
        if byte & TRIGGER_BIT != 0 && !channel.continuous() {
            channel.trigger(now);
        }
        Ok(())
    }

    fn read_block(&mut self, address: u8, len: usize) -> std::io::Result<Vec<u8>> {
        let now = Instant::now();
        let mut bank = self.bank.lock();
        if address == GENERAL_CALL {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "general-call address is write-only",
            ));
        }
        let channel = bank
            .channels
            .get_mut(&address)
            .ok_or_else(|| Self::no_device(address))?;
        if channel.fail_reads {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected read fault",
            ));
        }
        channel.settle(now);
        let block = channel.transmit(now, len);
        // Reading a ready result marks the latch stale until the next
        // conversion completes.
        if !channel.busy(now) {
            channel.already_read = true;
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::decode_raw;
    use std::thread::sleep;
    use std::time::Duration;

    const ADDR: u8 = 0x68;
    const OTHER: u8 = 0x6B;
    /// One-shot 16-bit configuration (66.7 ms per conversion).
    const ONE_SHOT_16: u8 = 0x08;

    fn sim_with_constant(code: i32) -> SimBus {
        SimBus::new().with_sensor(ADDR, SimProfile::Constant(code))
    }

    #[test]
    fn test_one_shot_busy_then_ready() {
        let mut sim = sim_with_constant(-5);
        sim.write_byte(ADDR, ONE_SHOT_16).unwrap();
        sim.write_byte(ADDR, ONE_SHOT_16 | TRIGGER_BIT).unwrap();

        let block = sim.read_block(ADDR, 3).unwrap();
        assert_ne!(block[2] & TRIGGER_BIT, 0, "mid-conversion read must be busy");

        sleep(Duration::from_millis(100));
        let block = sim.read_block(ADDR, 3).unwrap();
        assert_eq!(block[2] & TRIGGER_BIT, 0);
        let mode = ConversionMode::from_config_byte(ONE_SHOT_16);
        assert_eq!(decode_raw(&block[..2], mode), -5);
    }

    #[test]
    fn test_read_marks_latch_stale_until_next_conversion() {
        let mut sim = sim_with_constant(123);
        sim.write_byte(ADDR, ONE_SHOT_16).unwrap();
        sim.write_byte(ADDR, ONE_SHOT_16 | TRIGGER_BIT).unwrap();
        sleep(Duration::from_millis(100));

        let mode = ConversionMode::from_config_byte(ONE_SHOT_16);
        let block = sim.read_block(ADDR, 3).unwrap();
        assert_eq!(block[2] & TRIGGER_BIT, 0, "fresh result reads as ready");
        assert_eq!(decode_raw(&block[..2], mode), 123);

        // Re-reads return the same data flagged not-ready.
        let block = sim.read_block(ADDR, 3).unwrap();
        assert_ne!(block[2] & TRIGGER_BIT, 0);
        assert_eq!(decode_raw(&block[..2], mode), 123);
        assert_eq!(sim.conversions(ADDR), 1);

        // A new conversion makes the latch fresh again.
        sim.write_byte(ADDR, ONE_SHOT_16 | TRIGGER_BIT).unwrap();
        sleep(Duration::from_millis(100));
        let block = sim.read_block(ADDR, 3).unwrap();
        assert_eq!(block[2] & TRIGGER_BIT, 0);
        assert_eq!(sim.conversions(ADDR), 2);
    }

    #[test]
    fn test_general_call_reaches_every_channel() {
        let mut sim = SimBus::new()
            .with_sensor(ADDR, SimProfile::Constant(1))
            .with_sensor(OTHER, SimProfile::Constant(2));
        sim.write_byte(ADDR, ONE_SHOT_16).unwrap();
        sim.write_byte(OTHER, ONE_SHOT_16).unwrap();

        sim.write_byte(GENERAL_CALL, GC_CONVERT).unwrap();
        sleep(Duration::from_millis(100));
        assert_eq!(sim.conversions(ADDR), 1);
        assert_eq!(sim.conversions(OTHER), 1);
    }

    #[test]
    fn test_general_call_reset_restores_power_on() {
        let mut sim = sim_with_constant(9);
        sim.write_byte(ADDR, ONE_SHOT_16).unwrap();
        assert_eq!(sim.config_byte(ADDR), Some(ONE_SHOT_16));
        sim.write_byte(GENERAL_CALL, GC_RESET).unwrap();
        assert_eq!(sim.config_byte(ADDR), Some(POWER_ON_CONFIG));
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let mut sim = SimBus::new();
        let err = sim.read_block(0x6F, 3).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        let err = sim.write_byte(0x6F, 0x10).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_injected_read_fault_clears() {
        let mut sim = sim_with_constant(7);
        sim.fail_reads(ADDR, true);
        assert!(sim.read_block(ADDR, 3).is_err());
        sim.fail_reads(ADDR, false);
        assert!(sim.read_block(ADDR, 3).is_ok());
    }

    #[test]
    fn test_power_on_state_is_ready_with_garbage() {
        let mut sim = sim_with_constant(42);
        // Continuous power-on state: ready immediately, stale latch.
        let block = sim.read_block(ADDR, 3).unwrap();
        assert_eq!(block[2] & TRIGGER_BIT, 0);
        let mode = ConversionMode::from_config_byte(POWER_ON_CONFIG);
        assert_eq!(decode_raw(&block[..2], mode), POWER_ON_GARBAGE);
    }

    #[test]
    fn test_ramp_folds_into_mode_range() {
        let mode = ConversionMode::from_config_byte(ONE_SHOT_16);
        let mut profile = SimProfile::Ramp {
            start: 0x7F00,
            step: 0x40,
        };
        let half = i64::from(mode.mask) + 1;
        for n in 0..32 {
            let value = i64::from(profile.next_raw(n, mode));
            assert!(value >= -half && value < half);
        }
    }

    #[test]
    fn test_ambient_profile_is_deterministic() {
        let mode = ConversionMode::from_config_byte(0x1C);
        let mut a = SimProfile::ambient(11);
        let mut b = SimProfile::ambient(11);
        for n in 0..16 {
            assert_eq!(a.next_raw(n, mode), b.next_raw(n, mode));
        }
    }
}
