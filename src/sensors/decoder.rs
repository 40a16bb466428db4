//! Characteristic decoders for Heart Rate, RSC, CSC, Cycling Power and
//! FTMS Indoor Bike Data notifications.
//!
//! Parsing is split from state handling: every payload is parsed completely
//! before any [`DecoderState`] is touched, so a malformed notification leaves
//! the previous revolution counters exactly as they were.

use crate::sensors::gatt::{
    characteristic_name, CSC_MEASUREMENT_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    HEART_RATE_MEASUREMENT_UUID, INDOOR_BIKE_DATA_UUID, RSC_MEASUREMENT_UUID,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Event times in CSC notifications are 1/1024 s ticks in a u16, so they roll
/// over every 64 seconds.
pub const EVENT_TIME_ROLLOVER_S: f64 = 64.0;

const EVENT_TIME_RESOLUTION: f64 = 1024.0;

/// Errors raised while decoding a notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{characteristic} payload truncated: needed {needed} bytes at offset {offset}, got {len}")]
    Truncated {
        characteristic: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("no decoder for characteristic {0}")]
    UnsupportedCharacteristic(Uuid),
}

/// Little-endian cursor over a notification payload.
struct ByteReader<'a> {
    characteristic: &'static str,
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(characteristic: &'static str, data: &'a [u8]) -> Self {
        Self {
            characteristic,
            data,
            offset: 0,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.offset + N;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(DecodeError::Truncated {
                characteristic: self.characteristic,
                offset: self.offset,
                needed: N,
                len: self.data.len(),
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.offset = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    fn u24(&mut self) -> Result<u32, DecodeError> {
        let [a, b, c] = self.take()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.offset + n > self.data.len() {
            return Err(DecodeError::Truncated {
                characteristic: self.characteristic,
                offset: self.offset,
                needed: n,
                len: self.data.len(),
            });
        }
        self.offset += n;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

/// Heart rate sample, timestamped in milliseconds since session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub t_ms: u64,
    pub bpm: u16,
    /// First RR interval of the notification, in seconds
    pub rr_interval_s: Option<f64>,
    /// Expended energy in kilojoules
    pub energy_kj: Option<f64>,
}

/// Running speed and cadence sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningSample {
    pub t_s: f64,
    pub speed_mps: f64,
    pub cadence_spm: u16,
    pub stride_len_m: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub is_running: Option<bool>,
    pub power_w: Option<i32>,
}

/// Cycling speed, cadence and power sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CyclingSample {
    pub t_s: f64,
    pub cum_wheel_revs: Option<u32>,
    pub last_wheel_event_s: Option<f64>,
    pub cum_crank_revs: Option<u16>,
    pub last_crank_event_s: Option<f64>,
    pub power_w: Option<i32>,
    pub speed_mps: Option<f64>,
    pub wheel_rpm: Option<f64>,
    pub cadence_rpm: Option<f64>,
    /// Only reported by FTMS trainers
    pub total_distance_m: Option<f64>,
}

/// Instantaneous power from a Cycling Power Measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub t_s: f64,
    pub power_w: i32,
}

/// Trainer telemetry from FTMS Indoor Bike Data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerSample {
    pub t_s: f64,
    pub speed_mps: Option<f64>,
    pub cadence_rpm: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub power_w: Option<i32>,
    pub heart_rate_bpm: Option<u8>,
}

/// One decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    HeartRate(HeartRateSample),
    Running(RunningSample),
    Cycling(CyclingSample),
    Power(PowerSample),
    Trainer(TrainerSample),
}

// ---------------------------------------------------------------------------
// Decoder state and configuration
// ---------------------------------------------------------------------------

/// Bit widths of the cumulative revolution counters.
///
/// The CSC profile defines a 32-bit wheel and a 16-bit crank counter, but some
/// older firmware wraps the wheel counter at 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterWidths {
    pub wheel_bits: u32,
    pub crank_bits: u32,
}

impl Default for CounterWidths {
    fn default() -> Self {
        Self {
            wheel_bits: 32,
            crank_bits: 16,
        }
    }
}

/// Static decoder parameters, shared by every connection of a role.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
    /// Wheel circumference in meters; without it no CSC speed is derived
    pub wheel_circumference_m: Option<f64>,
    pub counters: CounterWidths,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            wheel_circumference_m: Some(2.105),
            counters: CounterWidths::default(),
        }
    }
}

/// A cumulative revolution count and the event time it was observed at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevolutionEvent {
    pub count: u32,
    pub time_s: f64,
}

impl RevolutionEvent {
    /// Revolutions and seconds elapsed since `prev`, corrected for counter
    /// wraparound and event-time rollover.
    pub fn delta_since(&self, prev: &RevolutionEvent, counter_bits: u32) -> (u64, f64) {
        let mask = if counter_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << counter_bits) - 1
        };
        let d_revs = u64::from(self.count).wrapping_sub(u64::from(prev.count)) & mask;
        let dt = (self.time_s - prev.time_s).rem_euclid(EVENT_TIME_ROLLOVER_S);
        (d_revs, dt)
    }
}

/// Per-connection CSC state: previous wheel and crank events.
///
/// Counters are connection scoped; a fresh state is created for every
/// connection and never shared between tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderState {
    pub wheel: Option<RevolutionEvent>,
    pub crank: Option<RevolutionEvent>,
}

impl DecoderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Raw parsers
// ---------------------------------------------------------------------------

/// Parsed Heart Rate Measurement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartRateMeasurement {
    pub heart_rate_bpm: u16,
    /// RR intervals in 1/1024 s units
    pub rr_intervals: Vec<u16>,
    /// Energy expended in kJ
    pub energy_expended: Option<u16>,
    pub sensor_contact: bool,
}

/// Parse a Heart Rate Measurement notification.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let mut reader = ByteReader::new("heart_rate", data);
    let flags = reader.u8()?;

    let heart_rate_bpm = if flags & 0x01 != 0 {
        reader.u16()?
    } else {
        u16::from(reader.u8()?)
    };

    let contact_supported = flags & 0x04 != 0;
    let mut result = HeartRateMeasurement {
        heart_rate_bpm,
        sensor_contact: contact_supported && flags & 0x02 != 0,
        ..Default::default()
    };

    if flags & 0x08 != 0 {
        result.energy_expended = Some(reader.u16()?);
    }

    if flags & 0x10 != 0 {
        while reader.remaining() >= 2 {
            result.rr_intervals.push(reader.u16()?);
        }
    }

    Ok(result)
}

/// Parsed RSC Measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RscMeasurement {
    pub speed_mps: f64,
    pub cadence_spm: u8,
    pub stride_len_m: Option<f64>,
    pub total_distance_m: Option<f64>,
    pub is_running: bool,
}

/// Parse an RSC Measurement notification.
pub fn parse_rsc_measurement(data: &[u8]) -> Result<RscMeasurement, DecodeError> {
    let mut reader = ByteReader::new("rsc", data);
    let flags = reader.u8()?;

    // Speed is in 1/256 m/s, cadence in steps per minute
    let speed_mps = f64::from(reader.u16()?) / 256.0;
    let cadence_spm = reader.u8()?;

    let stride_len_m = if flags & 0x01 != 0 {
        Some(f64::from(reader.u16()?) / 100.0)
    } else {
        None
    };

    let total_distance_m = if flags & 0x02 != 0 {
        Some(f64::from(reader.u32()?) / 10.0)
    } else {
        None
    };

    Ok(RscMeasurement {
        speed_mps,
        cadence_spm,
        stride_len_m,
        total_distance_m,
        is_running: flags & 0x04 != 0,
    })
}

/// Parsed CSC Measurement: raw counters and 1/1024 s event times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CscMeasurement {
    pub wheel: Option<(u32, u16)>,
    pub crank: Option<(u16, u16)>,
}

/// Parse a CSC Measurement notification.
pub fn parse_csc_measurement(data: &[u8]) -> Result<CscMeasurement, DecodeError> {
    let mut reader = ByteReader::new("csc", data);
    let flags = reader.u8()?;
    let mut result = CscMeasurement::default();

    if flags & 0x01 != 0 {
        let revs = reader.u32()?;
        let event = reader.u16()?;
        result.wheel = Some((revs, event));
    }

    if flags & 0x02 != 0 {
        let revs = reader.u16()?;
        let event = reader.u16()?;
        result.crank = Some((revs, event));
    }

    Ok(result)
}

/// Parse a Cycling Power Measurement notification, returning the
/// instantaneous power. Optional fields behind the flags are not needed here.
pub fn parse_cycling_power_measurement(data: &[u8]) -> Result<i16, DecodeError> {
    let mut reader = ByteReader::new("cycling_power", data);
    reader.skip(2)?;
    reader.i16()
}

/// Parsed data from Indoor Bike Data characteristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Instantaneous cadence in RPM
    pub cadence_rpm: Option<f64>,
    /// Total distance in meters
    pub total_distance_m: Option<u32>,
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    pub heart_rate_bpm: Option<u8>,
}

/// Parse Indoor Bike Data notification.
///
/// Fields appear in flag order. Instantaneous speed is present when the
/// "More Data" bit (bit 0) is clear.
pub fn parse_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData, DecodeError> {
    let mut reader = ByteReader::new("indoor_bike_data", data);
    let flags = reader.u16()?;
    let has = |bit: u16| flags & (1 << bit) != 0;
    let mut result = IndoorBikeData::default();

    if !has(0) {
        result.speed_kmh = Some(f64::from(reader.u16()?) / 100.0);
    }
    if has(1) {
        reader.skip(2)?; // average speed
    }
    if has(2) {
        // 0.5 rpm resolution
        result.cadence_rpm = Some(f64::from(reader.u16()?) / 2.0);
    }
    if has(3) {
        reader.skip(2)?; // average cadence
    }
    if has(4) {
        result.total_distance_m = Some(reader.u24()?);
    }
    if has(5) {
        reader.skip(2)?; // resistance level
    }
    if has(6) {
        result.power_watts = Some(reader.i16()?);
    }
    if has(7) {
        reader.skip(2)?; // average power
    }
    if has(8) {
        reader.skip(5)?; // total energy, per hour, per minute
    }
    if has(9) {
        result.heart_rate_bpm = Some(reader.u8()?);
    }

    Ok(result)
}

// ---------------------------------------------------------------------------
// Stateful decoding
// ---------------------------------------------------------------------------

/// Decode a Heart Rate Measurement into a sample.
pub fn decode_heart_rate(data: &[u8], elapsed: Duration) -> Result<HeartRateSample, DecodeError> {
    let parsed = parse_heart_rate_measurement(data)?;
    Ok(HeartRateSample {
        t_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        bpm: parsed.heart_rate_bpm,
        rr_interval_s: parsed
            .rr_intervals
            .first()
            .map(|rr| f64::from(*rr) / EVENT_TIME_RESOLUTION),
        energy_kj: parsed.energy_expended.map(f64::from),
    })
}

/// Decode an RSC Measurement into a sample. Power is filled in by fusion.
pub fn decode_rsc(data: &[u8], elapsed: Duration) -> Result<RunningSample, DecodeError> {
    let parsed = parse_rsc_measurement(data)?;
    Ok(RunningSample {
        t_s: elapsed.as_secs_f64(),
        speed_mps: parsed.speed_mps,
        cadence_spm: u16::from(parsed.cadence_spm),
        stride_len_m: parsed.stride_len_m,
        total_distance_m: parsed.total_distance_m,
        is_running: Some(parsed.is_running),
        power_w: None,
    })
}

/// Decode a CSC Measurement, deriving speed and rpm against `state`.
///
/// Derived values are only produced when a previous event exists and the
/// rollover-corrected elapsed time is strictly positive. `state` is updated
/// only after the payload parsed successfully.
pub fn decode_csc(
    data: &[u8],
    elapsed: Duration,
    state: &mut DecoderState,
    config: &DecoderConfig,
) -> Result<CyclingSample, DecodeError> {
    let parsed = parse_csc_measurement(data)?;
    let mut sample = CyclingSample {
        t_s: elapsed.as_secs_f64(),
        ..Default::default()
    };

    if let Some((revs, ticks)) = parsed.wheel {
        let current = RevolutionEvent {
            count: revs,
            time_s: f64::from(ticks) / EVENT_TIME_RESOLUTION,
        };
        sample.cum_wheel_revs = Some(revs);
        sample.last_wheel_event_s = Some(current.time_s);

        if let Some(prev) = state.wheel {
            let (d_revs, dt) = current.delta_since(&prev, config.counters.wheel_bits);
            if dt > 0.0 {
                let d_revs = d_revs as f64;
                sample.wheel_rpm = Some(d_revs / dt * 60.0);
                sample.speed_mps = config
                    .wheel_circumference_m
                    .map(|circumference| d_revs * circumference / dt);
            }
        }
        state.wheel = Some(current);
    }

    if let Some((revs, ticks)) = parsed.crank {
        let current = RevolutionEvent {
            count: u32::from(revs),
            time_s: f64::from(ticks) / EVENT_TIME_RESOLUTION,
        };
        sample.cum_crank_revs = Some(revs);
        sample.last_crank_event_s = Some(current.time_s);

        if let Some(prev) = state.crank {
            let (d_revs, dt) = current.delta_since(&prev, config.counters.crank_bits);
            if dt > 0.0 {
                sample.cadence_rpm = Some(d_revs as f64 / dt * 60.0);
            }
        }
        state.crank = Some(current);
    }

    Ok(sample)
}

/// Decode a Cycling Power Measurement.
pub fn decode_cycling_power(data: &[u8], elapsed: Duration) -> Result<PowerSample, DecodeError> {
    let power = parse_cycling_power_measurement(data)?;
    Ok(PowerSample {
        t_s: elapsed.as_secs_f64(),
        power_w: i32::from(power),
    })
}

/// Decode FTMS Indoor Bike Data.
pub fn decode_indoor_bike_data(
    data: &[u8],
    elapsed: Duration,
) -> Result<TrainerSample, DecodeError> {
    let parsed = parse_indoor_bike_data(data)?;
    Ok(TrainerSample {
        t_s: elapsed.as_secs_f64(),
        speed_mps: parsed.speed_kmh.map(|kmh| kmh / 3.6),
        cadence_rpm: parsed.cadence_rpm,
        total_distance_m: parsed.total_distance_m.map(f64::from),
        power_w: parsed.power_watts.map(i32::from),
        heart_rate_bpm: parsed.heart_rate_bpm,
    })
}

/// Decode any supported characteristic.
///
/// `elapsed` is the notification arrival time relative to the session clock.
pub fn decode(
    characteristic: Uuid,
    data: &[u8],
    elapsed: Duration,
    state: &mut DecoderState,
    config: &DecoderConfig,
) -> Result<Reading, DecodeError> {
    match characteristic {
        HEART_RATE_MEASUREMENT_UUID => decode_heart_rate(data, elapsed).map(Reading::HeartRate),
        RSC_MEASUREMENT_UUID => decode_rsc(data, elapsed).map(Reading::Running),
        CSC_MEASUREMENT_UUID => decode_csc(data, elapsed, state, config).map(Reading::Cycling),
        CYCLING_POWER_MEASUREMENT_UUID => decode_cycling_power(data, elapsed).map(Reading::Power),
        INDOOR_BIKE_DATA_UUID => decode_indoor_bike_data(data, elapsed).map(Reading::Trainer),
        other => {
            tracing::trace!("Ignoring {} notification", characteristic_name(&other));
            Err(DecodeError::UnsupportedCharacteristic(other))
        }
    }
}
