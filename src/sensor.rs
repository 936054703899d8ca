//! MCP342x delta-sigma sensor protocol.
//!
//! Device model: each sensor is one ADC channel at an address in
//! `0x68..=0x6F`. Writing the configuration byte selects resolution and
//! conversion mode; setting the top bit requests one conversion in one-shot
//! mode. A read transfers the conversion data bytes followed by the current
//! configuration byte, whose top bit doubles as the not-ready flag. The
//! device sign-extends the sample into the transmitted word, so decoding
//! masks to the mode's sample bits and folds the sign back in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::SharedBus;
use crate::error::Result;

/// First device address; channels 0..=7 map onto `0x68..=0x6F`.
pub const BASE_ADDRESS: u8 = 0x68;
/// Number of addressable channels on one bus.
pub const CHANNEL_COUNT: u8 = 8;
/// Address used on control rows; the general-call address is never a device.
pub const SENTINEL_ADDRESS: u8 = 0x00;

/// One-shot trigger / not-ready bit of the configuration byte.
const TRIGGER_BIT: u8 = 0x80;
/// Continuous-conversion bit of the configuration byte.
const CONTINUOUS_BIT: u8 = 0x10;
/// Mask clearing the trigger and continuous bits.
const ONE_SHOT_MASK: u8 = 0x6F;

/// One conversion mode: resolution, rate, and decode parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionMode {
    /// Resolution in bits.
    pub bits: u8,
    /// Conversion rate in hertz.
    pub rate_hz: f64,
    /// Mask selecting the transmitted sample bits (sign bit excluded).
    pub mask: u32,
    /// Configuration byte selecting this mode at gain ×1, continuous bit set.
    pub config_byte: u8,
    /// Factory calibration slope (raw counts to degrees Celsius).
    pub default_slope: f64,
    /// Factory calibration intercept in degrees Celsius.
    pub default_intercept: f64,
}

/// The four supported conversion modes, indexed 0..=3.
pub const MODES: [ConversionMode; 4] = [
    ConversionMode {
        bits: 12,
        rate_hz: 240.0,
        mask: 0x7FF,
        config_byte: 0x10,
        default_slope: 62.850_27e-3,
        default_intercept: 70.643_85,
    },
    ConversionMode {
        bits: 14,
        rate_hz: 60.0,
        mask: 0x1FFF,
        config_byte: 0x14,
        default_slope: 15.712_57e-3,
        default_intercept: 70.643_85,
    },
    ConversionMode {
        bits: 16,
        rate_hz: 15.0,
        mask: 0x7FFF,
        config_byte: 0x18,
        default_slope: 3.928_142e-3,
        default_intercept: 70.643_85,
    },
    ConversionMode {
        bits: 18,
        rate_hz: 3.75,
        mask: 0x1_FFFF,
        config_byte: 0x1C,
        default_slope: 982.035_4e-6,
        default_intercept: 70.643_85,
    },
];

impl ConversionMode {
    /// Mode for a table index, if in range.
    pub fn from_index(index: usize) -> Option<&'static ConversionMode> {
        MODES.get(index)
    }

    /// Mode selected by a configuration byte (resolution bits 2..=3).
    pub fn from_config_byte(config: u8) -> &'static ConversionMode {
        &MODES[usize::from((config >> 2) & 0x03)]
    }

    /// Position of this mode in the table.
    pub fn index(&self) -> usize {
        usize::from((self.config_byte >> 2) & 0x03)
    }

    /// Time one conversion takes at this resolution.
    pub fn conversion_time(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Number of data bytes transmitted ahead of the status byte.
    pub fn data_len(&self) -> usize {
        if self.bits == 18 {
            3
        } else {
            2
        }
    }

    /// Total transfer length of one read: data bytes plus the status byte.
    pub fn transfer_len(&self) -> usize {
        self.data_len() + 1
    }
}

/// Recovers the signed sample value from transmitted data bytes.
///
/// The first transmitted byte's top bit carries the sign (the device
/// sign-extends), so a set bit means the masked magnitude represents a
/// negative two's-complement value and `mask + 1` is subtracted.
pub fn decode_raw(data: &[u8], mode: &ConversionMode) -> i32 {
    let wide = data
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte));
    let magnitude = (wide & mode.mask) as i32;
    let negative = data.first().is_some_and(|byte| byte & 0x80 != 0);
    if negative {
        magnitude - (mode.mask as i32 + 1)
    } else {
        magnitude
    }
}

/// Display unit for cooked values; conversion happens at display time only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Degrees Celsius, the sensor-native unit.
    Celsius,
    /// Kelvin.
    Kelvin,
    /// Degrees Fahrenheit.
    Fahrenheit,
}

impl Unit {
    /// Converts a native-Celsius value into this unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            Unit::Celsius => celsius,
            Unit::Kelvin => celsius + 273.15,
            Unit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }

    /// Display suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Kelvin => "K",
            Unit::Fahrenheit => "°F",
        }
    }
}

/// One decoded conversion result as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Bus address of the emitting sensor, or [`SENTINEL_ADDRESS`].
    pub address: u8,
    /// Signed ADC code within the mode's resolution.
    pub raw: i32,
    /// Calibrated value in degrees Celsius.
    pub cooked: f64,
}

impl Sample {
    /// Control marker that unblocks a parked reader during shutdown.
    /// Never persisted.
    pub const SENTINEL: Sample = Sample {
        address: SENTINEL_ADDRESS,
        raw: 0,
        cooked: 0.0,
    };

    /// True for the shutdown control marker.
    pub fn is_sentinel(&self) -> bool {
        self.address == SENTINEL_ADDRESS
    }
}

/// One sensor channel bound to the shared bus.
///
/// Holds the current configuration byte and the most recently latched
/// conversion, mirroring the device's own registers. Owned by exactly one
/// acquisition task; only the bus handle is shared.
#[derive(Debug)]
pub struct SensorDevice {
    bus: SharedBus,
    address: u8,
    mode: &'static ConversionMode,
    config: u8,
    slope: f64,
    intercept: f64,
    latched_raw: i32,
    latched_status: u8,
}

impl SensorDevice {
    /// Binds a channel at `address` with the given mode and calibration.
    pub fn new(
        bus: SharedBus,
        address: u8,
        mode: &'static ConversionMode,
        slope: f64,
        intercept: f64,
    ) -> Self {
        Self {
            bus,
            address,
            mode,
            config: mode.config_byte,
            slope,
            intercept,
            latched_raw: 0,
            latched_status: 0,
        }
    }

    /// Bus address of this sensor.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Conversion mode this sensor is configured for.
    pub fn mode(&self) -> &'static ConversionMode {
        self.mode
    }

    /// Writes the current configuration byte; doubles as the presence probe.
    pub fn configure(&mut self) -> Result<()> {
        self.bus.write_byte(self.address, self.config)
    }

    /// Switches to continuous conversion.
    pub fn start_continuous(&mut self) -> Result<()> {
        self.config |= CONTINUOUS_BIT;
        self.bus.write_byte(self.address, self.config)
    }

    /// Leaves continuous conversion and arms one-shot operation.
    ///
    /// The write carries the trigger bit, so one conversion starts as a side
    /// effect; its result is the cold-start reading the acquisition task
    /// discards.
    pub fn stop_continuous(&mut self) -> Result<()> {
        self.config &= ONE_SHOT_MASK;
        self.bus.write_byte(self.address, self.config | TRIGGER_BIT)
    }

    /// Requests one conversion from this sensor alone.
    pub fn trigger_one_shot(&mut self) -> Result<()> {
        self.bus.write_byte(self.address, self.config | TRIGGER_BIT)
    }

    /// Reads the conversion registers; returns `(raw, ready)` and latches
    /// both for later [`sample`](Self::sample) calls.
    pub fn read_raw_and_status(&mut self) -> Result<(i32, bool)> {
        let wanted = self.mode.transfer_len();
        let block = self.bus.read_block(self.address, wanted)?;
        if block.len() < wanted {
            return Err(crate::error::Error::Bus {
                address: self.address,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read: {} of {wanted} bytes", block.len()),
                ),
            });
        }
        let data = &block[..self.mode.data_len()];
        let raw = decode_raw(data, self.mode);
        self.latched_raw = raw;
        self.latched_status = block[self.mode.data_len()];
        Ok((raw, self.ready()))
    }

    /// Reads the conversion registers and reports readiness only.
    pub fn read_status(&mut self) -> Result<bool> {
        self.read_raw_and_status().map(|(_, ready)| ready)
    }

    /// Whether the last latched status byte flagged a completed conversion.
    pub fn ready(&self) -> bool {
        self.latched_status & TRIGGER_BIT == 0
    }

    /// Builds a [`Sample`] from the most recently latched conversion.
    pub fn sample(&self) -> Sample {
        Sample {
            address: self.address,
            raw: self.latched_raw,
            cooked: f64::from(self.latched_raw) * self.slope + self.intercept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::I2cBus;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct ScriptedBus {
        writes: Arc<Mutex<Vec<(u8, u8)>>>,
        replies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ScriptedBus {
        fn push_reply(&self, block: Vec<u8>) {
            self.replies.lock().push(block);
        }
    }

    impl I2cBus for ScriptedBus {
        fn write_byte(&mut self, address: u8, byte: u8) -> std::io::Result<()> {
            self.writes.lock().push((address, byte));
            Ok(())
        }

        fn read_block(&mut self, _address: u8, _len: usize) -> std::io::Result<Vec<u8>> {
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "script exhausted",
                ));
            }
            Ok(replies.remove(0))
        }
    }

    fn device_with_script(mode_index: usize) -> (SensorDevice, ScriptedBus) {
        let script = ScriptedBus::default();
        let bus = SharedBus::new(Box::new(script.clone()));
        let mode = &MODES[mode_index];
        (
            SensorDevice::new(bus, 0x68, mode, mode.default_slope, mode.default_intercept),
            script,
        )
    }

    #[test]
    fn test_mode_table_shape() {
        for (index, mode) in MODES.iter().enumerate() {
            assert_eq!(mode.index(), index);
            assert_eq!(mode.mask, (1 << (mode.bits - 1)) - 1);
            assert_eq!(ConversionMode::from_config_byte(mode.config_byte), mode);
            assert!(mode.conversion_time() > Duration::ZERO);
        }
        assert_eq!(MODES[0].conversion_time(), Duration::from_secs_f64(1.0 / 240.0));
        assert_eq!(MODES[3].transfer_len(), 4);
        assert_eq!(MODES[0].transfer_len(), 3);
    }

    #[test]
    fn test_decode_positive_and_negative() {
        let mode12 = &MODES[0];
        // +0x500 stays positive; sign-extended -1 folds back to -1.
        assert_eq!(decode_raw(&[0x05, 0x00], mode12), 0x500);
        assert_eq!(decode_raw(&[0xFF, 0xFF], mode12), -1);
        // 12-bit minimum: -2048 transmitted as 0xF800.
        assert_eq!(decode_raw(&[0xF8, 0x00], mode12), -2048);
        assert_eq!(decode_raw(&[0x07, 0xFF], mode12), 2047);

        let mode18 = &MODES[3];
        assert_eq!(decode_raw(&[0xFF, 0xFF, 0xFF], mode18), -1);
        assert_eq!(decode_raw(&[0x01, 0xFF, 0xFF], mode18), 0x1_FFFF);
        assert_eq!(decode_raw(&[0xFE, 0x00, 0x00], mode18), -0x2_0000);
    }

    #[test]
    fn test_decode_range_bounds() {
        for mode in &MODES {
            let half = i64::from(mode.mask) + 1;
            for &(data_hi, value) in &[(0x00u8, 0i64), (0x80u8, -half)] {
                let mut data = vec![0u8; mode.data_len()];
                data[0] = data_hi;
                let decoded = i64::from(decode_raw(&data, mode));
                assert_eq!(decoded, value);
                assert!(decoded >= -half && decoded <= i64::from(mode.mask));
            }
        }
    }

    #[test]
    fn test_unit_conversion() {
        assert!((Unit::Kelvin.from_celsius(0.0) - 273.15).abs() < 1e-12);
        assert!((Unit::Fahrenheit.from_celsius(100.0) - 212.0).abs() < 1e-12);
        assert_eq!(Unit::Celsius.from_celsius(-40.0), -40.0);
        assert_eq!(Unit::Fahrenheit.from_celsius(-40.0), -40.0);
    }

    #[test]
    fn test_sentinel_marker() {
        assert!(Sample::SENTINEL.is_sentinel());
        let real = Sample {
            address: BASE_ADDRESS,
            raw: 42,
            cooked: 21.0,
        };
        assert!(!real.is_sentinel());
    }

    #[test]
    fn test_one_shot_config_transitions() {
        let (mut device, script) = device_with_script(3);
        device.configure().unwrap();
        device.stop_continuous().unwrap();
        device.trigger_one_shot().unwrap();
        device.start_continuous().unwrap();
        let writes = script.writes.lock().clone();
        // 18-bit: continuous config 0x1C, one-shot arm 0x8C, trigger 0x8C,
        // continuous restart 0x1C.
        assert_eq!(
            writes,
            vec![(0x68, 0x1C), (0x68, 0x8C), (0x68, 0x8C), (0x68, 0x1C)]
        );
    }

    #[test]
    fn test_read_latches_raw_and_status() {
        let (mut device, script) = device_with_script(0);
        // Busy first (status bit 7 set), then ready with a real value.
        script.push_reply(vec![0x00, 0x00, 0x90]);
        script.push_reply(vec![0x02, 0x9A, 0x10]);

        let (_, ready) = device.read_raw_and_status().unwrap();
        assert!(!ready);

        let (raw, ready) = device.read_raw_and_status().unwrap();
        assert!(ready);
        assert_eq!(raw, 0x29A);
        let sample = device.sample();
        assert_eq!(sample.address, 0x68);
        assert_eq!(sample.raw, 0x29A);
        let expected = f64::from(0x29A) * MODES[0].default_slope + MODES[0].default_intercept;
        assert!((sample.cooked - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cooked_is_linear_in_raw() {
        let mode = &MODES[1];
        let bus = SharedBus::new(Box::new(ScriptedBus::default()));
        let device = SensorDevice::new(bus, 0x6B, mode, 2.0, -1.0);
        // Latched raw defaults to zero: cooked is the intercept alone.
        assert!((device.sample().cooked - -1.0).abs() < 1e-12);
    }
}
