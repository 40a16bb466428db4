//! GATT service/characteristic identifiers and control point commands.
//!
//! Covers the Bluetooth SIG fitness profiles the acquisition core speaks:
//! Heart Rate, Running Speed and Cadence, Cycling Speed and Cadence,
//! Cycling Power and the Fitness Machine Service.

use uuid::Uuid;

/// Build a full 128-bit UUID from a 16-bit SIG-assigned number.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = sig_uuid(0x180d);

/// Heart Rate Measurement UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = sig_uuid(0x2a37);

/// Running Speed and Cadence Service UUID (0x1814)
pub const RSC_SERVICE_UUID: Uuid = sig_uuid(0x1814);

/// RSC Measurement UUID (0x2A53)
pub const RSC_MEASUREMENT_UUID: Uuid = sig_uuid(0x2a53);

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = sig_uuid(0x1816);

/// CSC Measurement UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = sig_uuid(0x2a5b);

/// SC Control Point UUID (0x2A55), shared by RSC and CSC
pub const SC_CONTROL_POINT_UUID: Uuid = sig_uuid(0x2a55);

/// Cycling Power Service UUID (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid = sig_uuid(0x1818);

/// Cycling Power Measurement UUID (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid = sig_uuid(0x2a63);

/// FTMS Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = sig_uuid(0x2ad2);

/// Fitness Machine Control Point UUID (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid = sig_uuid(0x2ad9);

/// Short human name for a known characteristic, used in logs.
pub fn characteristic_name(uuid: &Uuid) -> &'static str {
    match *uuid {
        HEART_RATE_MEASUREMENT_UUID => "heart_rate",
        RSC_MEASUREMENT_UUID => "rsc",
        CSC_MEASUREMENT_UUID => "csc",
        CYCLING_POWER_MEASUREMENT_UUID => "cycling_power",
        INDOOR_BIKE_DATA_UUID => "indoor_bike_data",
        SC_CONTROL_POINT_UUID => "sc_control_point",
        FTMS_CONTROL_POINT_UUID => "ftms_control_point",
        _ => "unknown",
    }
}

/// SC Control Point opcodes.
#[repr(u8)]
pub enum ScControlOpcode {
    /// Set cumulative value (wheel revolutions or total distance)
    SetCumulativeValue = 0x01,
    /// Response code prefix used in indications
    ResponseCode = 0x10,
}

/// FTMS Control Point opcodes used by this crate.
#[repr(u8)]
pub enum FtmsControlOpcode {
    /// Request control of the fitness machine
    RequestControl = 0x00,
    /// Reset the fitness machine
    Reset = 0x01,
    /// Set target power
    SetTargetPower = 0x05,
    /// Response code prefix used in indications
    ResponseCode = 0x80,
}

/// Which control point a command is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlPoint {
    /// SC Control Point on RSC/CSC sensors
    SpeedCadence,
    /// Fitness Machine Control Point on trainers
    FitnessMachine,
}

impl ControlPoint {
    /// Characteristic UUID of this control point.
    pub fn uuid(self) -> Uuid {
        match self {
            ControlPoint::SpeedCadence => SC_CONTROL_POINT_UUID,
            ControlPoint::FitnessMachine => FTMS_CONTROL_POINT_UUID,
        }
    }

    fn response_opcode(self) -> u8 {
        match self {
            ControlPoint::SpeedCadence => ScControlOpcode::ResponseCode as u8,
            ControlPoint::FitnessMachine => FtmsControlOpcode::ResponseCode as u8,
        }
    }
}

/// Result value carried in a control point response indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    Success,
    NotSupported,
    InvalidParameter,
    Failed,
    /// FTMS only: control has not been granted
    ControlNotPermitted,
    Unknown(u8),
}

impl ControlResult {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => ControlResult::Success,
            0x02 => ControlResult::NotSupported,
            0x03 => ControlResult::InvalidParameter,
            0x04 => ControlResult::Failed,
            0x05 => ControlResult::ControlNotPermitted,
            other => ControlResult::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == ControlResult::Success
    }
}

/// Parse a control point response indication.
///
/// Returns `None` when the payload is not a response to `request_opcode`.
pub fn parse_control_response(
    point: ControlPoint,
    request_opcode: u8,
    data: &[u8],
) -> Option<ControlResult> {
    match data {
        [op, req, result, ..] if *op == point.response_opcode() && *req == request_opcode => {
            Some(ControlResult::from_code(*result))
        }
        _ => None,
    }
}

/// Build an SC Control Point "set cumulative value" command.
///
/// Writing zero clears the total distance of a footpod (RSC) or the wheel
/// revolution counter of a CSC sensor.
pub fn build_set_cumulative_value(value: u32) -> Vec<u8> {
    let mut cmd = vec![ScControlOpcode::SetCumulativeValue as u8];
    cmd.extend_from_slice(&value.to_le_bytes());
    cmd
}

/// Build a control point command to request control.
pub fn build_request_control() -> Vec<u8> {
    vec![FtmsControlOpcode::RequestControl as u8]
}

/// Build a control point command to reset the fitness machine.
pub fn build_reset() -> Vec<u8> {
    vec![FtmsControlOpcode::Reset as u8]
}

/// Build a control point command to set target power (ERG mode).
pub fn build_set_target_power(target_watts: u16) -> Vec<u8> {
    let mut cmd = vec![FtmsControlOpcode::SetTargetPower as u8];
    cmd.extend_from_slice(&target_watts.to_le_bytes());
    cmd
}
