//! MAG-160 Core wire protocol: command codes, endpoint map and packet layouts.
//!
//! Every command is a sequence of little-endian 32-bit words whose first word
//! is the command code. Responses are fixed 64-byte packets read back from the
//! command-in endpoint.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const VENDOR_ID: u16 = 0x833c;
pub const PRODUCT_ID: u16 = 0x0001;
pub const INTERFACE: u8 = 0;

pub const RESPONSE_LEN: usize = 64;
pub const TRAILER_LEN: usize = 28;
/// Extra room requested on top of the image block for every image read.
pub const IMAGE_PACKET_SLACK: usize = 1024;
pub const CALIBRATION_CHUNK: usize = 16 * 1024;

pub const IMG_START_CODE: u32 = 0x1BB1B11B;
pub const IMG_END_CODE: u32 = 0x1BB1B11C;

pub const CMD_TIMEOUT: Duration = Duration::from_millis(800);
pub const TRANSFER_TOGGLE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(200);

/// Accepted calibration blob sizes: `[64 KiB, 100 MiB)`.
pub const CALIBRATION_SIZE_MIN: u32 = 65_536;
pub const CALIBRATION_SIZE_MAX: u32 = 104_857_600;

/// Offset between the raw FPA code and the camera body temperature code.
const CAM_TEMP_OFFSET: i64 = 500;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("device {vid:04x}:{pid:04x} not found")]
    DeviceNotFound { vid: u16, pid: u16 },
    #[error("endpoint {0:#04x} not present on interface")]
    EndpointResolutionFailed(u8),
    #[error("{operation} timed out on endpoint {endpoint:#04x}")]
    CommandTimeout {
        operation: &'static str,
        endpoint: u8,
    },
    #[error("invalid calibration size: {0} bytes")]
    InvalidCalibrationSize(u32),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("usb: {0}")]
    Usb(String),
}

/// Command codes understood by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    GetParameter1 = 0x6BB6B66B,
    GetParameter2 = 0x6BB6B66C,
    SetParameter1 = 0x6BB6B66D,
    SetParameter2 = 0x6BB6B66E,
    GetCaliInfo = 0x6BB6B66F,
    GetCaliFile = 0x6BB6B670,
    SendCaliFile = 0x6BB6B671,
    SetShutterState = 0x6BB6B672,
    StartTransferImg = 0x6BB6B673,
    StopTransferImg = 0x6BB6B674,
    GetLifeTime = 0x6BB6B675,
    PowerSave = 0x6BB6B677,
    SetFrameRate = 0x6BB6B679,
}

/// Codes found in the first word of a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Response {
    SendParameter1 = 0x5BB5B55B,
    SendParameter2 = 0x5BB5B55C,
    SendCaliFile = 0x5BB5B55D,
    SendCaliInfo = 0x5BB5B55E,
    CmdHandledAck = 0x5BB5B55F,
    CaliHandledAck = 0x5BB5B560,
    SendLifeTime = 0x5BB5B561,
}

/// Bulk endpoint addresses of interface 0.
pub mod endpoint {
    pub const COMMAND_OUT: u8 = 0x03;
    pub const CALIBRATION_OUT: u8 = 0x05;
    pub const IMAGE_IN: u8 = 0x81;
    pub const COMMAND_IN: u8 = 0x82;
    pub const CALIBRATION_IN: u8 = 0x84;

    pub const ALL: [u8; 5] = [COMMAND_OUT, CALIBRATION_OUT, IMAGE_IN, COMMAND_IN, CALIBRATION_IN];
}

/// Encode a command code followed by its argument words.
pub fn encode_command(command: Command, args: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * (1 + args.len()));
    for word in std::iter::once(command as u32).chain(args.iter().copied()) {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Leading code word of a response or trailer.
pub fn packet_code(packet: &[u8]) -> Option<u32> {
    packet.get(0..4).map(LittleEndian::read_u32)
}

fn ensure_len(packet: &[u8], needed: usize, what: &str) -> Result<(), ProtocolError> {
    if packet.len() < needed {
        return Err(ProtocolError::MalformedPacket(format!(
            "{what}: expected at least {needed} bytes, got {}",
            packet.len()
        )));
    }
    Ok(())
}

fn u32_at(p: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&p[offset..offset + 4])
}

/// Device description read once at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceParameters {
    pub serial_number: u32,
    /// Three bytes, little-endian.
    pub hardware_version: u32,
    pub device_type: u8,
    pub firmware_version: u32,
    pub fpa_serial_number: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub fpa_gain: u32,
    pub fpa_flip: u32,
    pub inter_frame: u32,
    pub inter_line: u32,
    pub gfid: u32,
    pub gsk: u32,

    pub base_line_acc: u32,
    pub denoise_level: u32,
    pub fpa_temp_fix: u16,
    pub shutter_close_speed: u32,
    pub shutter_open_speed: u32,
    pub ffc_trigger_frame: u32,
    pub ffc_trigger_temperature: u32,
    pub enlarge_range: u32,
    pub laser_pos: u32,
    pub at_zero_error_point: u32,
    pub at_error_slope: f32,
}

impl DeviceParameters {
    /// Decode the two parameter responses (`GetParameter1`, `GetParameter2`).
    pub fn parse(params1: &[u8], params2: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(params1, 60, "parameter 1 response")?;
        ensure_len(params2, 60, "parameter 2 response")?;

        let p1 = params1;
        let p2 = params2;
        Ok(Self {
            serial_number: u32_at(p1, 4),
            hardware_version: LittleEndian::read_u24(&p1[8..11]),
            device_type: p1[11],
            firmware_version: u32_at(p1, 12),
            fpa_serial_number: u32_at(p1, 16),
            width: u32_at(p1, 20),
            height: u32_at(p1, 24),
            fps: u32_at(p1, 28),
            fpa_gain: u32_at(p1, 36),
            fpa_flip: u32_at(p1, 40),
            inter_frame: u32_at(p1, 44),
            inter_line: u32_at(p1, 48),
            gfid: u32_at(p1, 52),
            gsk: u32_at(p1, 56),

            base_line_acc: u32_at(p2, 4),
            denoise_level: u32_at(p2, 8),
            fpa_temp_fix: LittleEndian::read_u16(&p2[18..20]),
            shutter_close_speed: u32_at(p2, 20),
            shutter_open_speed: u32_at(p2, 24),
            ffc_trigger_frame: u32_at(p2, 28),
            ffc_trigger_temperature: u32_at(p2, 32),
            enlarge_range: u32_at(p2, 36),
            laser_pos: u32_at(p2, 40),
            at_zero_error_point: u32_at(p2, 44),
            at_error_slope: LittleEndian::read_f32(&p2[48..52]),
        })
    }

    /// Bytes in the image block of a content packet.
    pub fn image_block_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    /// Buffer size requested for each image-in read.
    pub fn frame_packet_size(&self) -> usize {
        self.image_block_len() + IMAGE_PACKET_SLACK
    }

    /// Acquisition period derived from the reported frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }
}

/// Calibration blob description returned by `GetCaliInfo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationInfo {
    pub command: u32,
    pub size: u32,
    pub reserved: u32,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CalibrationInfo {
    /// Decode and validate a calibration-info response.
    pub fn parse(packet: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(packet, 20, "calibration info response")?;
        let size = u32_at(packet, 4);
        validate_calibration_size(size)?;
        let secs = LittleEndian::read_u64(&packet[12..20]);
        Ok(Self {
            command: u32_at(packet, 0),
            size,
            reserved: u32_at(packet, 8),
            timestamp: i64::try_from(secs)
                .ok()
                .and_then(|s| DateTime::from_timestamp(s, 0)),
        })
    }
}

pub fn validate_calibration_size(size: u32) -> Result<(), ProtocolError> {
    if (CALIBRATION_SIZE_MIN..CALIBRATION_SIZE_MAX).contains(&size) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidCalibrationSize(size))
    }
}

/// Telemetry carried in the last 28 bytes of an image content packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTrailer {
    pub code: u32,
    pub frame_index: u32,
    pub fpa_temp_raw: u32,
    pub dropped_interrupts: u32,
}

impl FrameTrailer {
    pub fn parse(trailer: &[u8]) -> Result<Self, ProtocolError> {
        if trailer.len() != TRAILER_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "trailer: expected {TRAILER_LEN} bytes, got {}",
                trailer.len()
            )));
        }
        let trailer = Self {
            code: u32_at(trailer, 0),
            frame_index: u32_at(trailer, 4),
            fpa_temp_raw: u32_at(trailer, 8),
            dropped_interrupts: u32_at(trailer, 12),
        };
        if trailer.code != IMG_END_CODE {
            return Err(ProtocolError::MalformedPacket(format!(
                "unexpected trailer code {:#010x}",
                trailer.code
            )));
        }
        Ok(trailer)
    }

    /// FPA temperature in °C, corrected by the device's temperature fix.
    pub fn fpa_temp_celsius(&self, temp_fix: u16) -> f32 {
        (i64::from(self.fpa_temp_raw) + i64::from(temp_fix)) as f32 / 1000.0
    }

    /// Camera body temperature in °C.
    pub fn cam_temp_celsius(&self, temp_fix: u16) -> f32 {
        (i64::from(self.fpa_temp_raw) - CAM_TEMP_OFFSET + i64::from(temp_fix)) as f32 / 1000.0
    }
}

#[cfg(test)]
pub(crate) mod test_packets {
    use super::*;

    pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
    }

    pub fn params1(width: u32, height: u32, fps: u32) -> Vec<u8> {
        let mut p = vec![0u8; RESPONSE_LEN];
        put_u32(&mut p, 0, Response::SendParameter1 as u32);
        put_u32(&mut p, 4, 0x0102_0304);
        p[8..11].copy_from_slice(&[0x01, 0x02, 0x03]);
        p[11] = 0x03;
        put_u32(&mut p, 12, 42);
        put_u32(&mut p, 20, width);
        put_u32(&mut p, 24, height);
        put_u32(&mut p, 28, fps);
        put_u32(&mut p, 36, 7);
        p
    }

    pub fn params2(temp_fix: u16) -> Vec<u8> {
        let mut p = vec![0u8; RESPONSE_LEN];
        put_u32(&mut p, 0, Response::SendParameter2 as u32);
        LittleEndian::write_u16(&mut p[18..20], temp_fix);
        put_u32(&mut p, 28, 900);
        put_u32(&mut p, 32, 300);
        LittleEndian::write_f32(&mut p[48..52], 1.5);
        p
    }

    pub fn cali_info(size: u32) -> Vec<u8> {
        let mut p = vec![0u8; RESPONSE_LEN];
        put_u32(&mut p, 0, Response::SendCaliInfo as u32);
        put_u32(&mut p, 4, size);
        LittleEndian::write_u64(&mut p[12..20], 1_700_000_000);
        p
    }

    pub fn ack() -> Vec<u8> {
        let mut p = vec![0u8; RESPONSE_LEN];
        put_u32(&mut p, 0, Response::CmdHandledAck as u32);
        p
    }

    /// Content packet with every pixel set to `value`.
    pub fn content(width: u32, height: u32, value: u16, frame_index: u32, fpa_raw: u32) -> Vec<u8> {
        let pixels = (width * height) as usize;
        let mut p = vec![0u8; pixels * 2 + TRAILER_LEN];
        for px in 0..pixels {
            LittleEndian::write_u16(&mut p[px * 2..px * 2 + 2], value);
        }
        let t = pixels * 2;
        put_u32(&mut p, t, IMG_END_CODE);
        put_u32(&mut p, t + 4, frame_index);
        put_u32(&mut p, t + 8, fpa_raw);
        put_u32(&mut p, t + 12, 2);
        p
    }

    pub fn header() -> Vec<u8> {
        let mut p = vec![0u8; 28];
        put_u32(&mut p, 0, IMG_START_CODE);
        p
    }
}

#[cfg(test)]
mod tests {
    use super::test_packets::*;
    use super::*;

    #[test]
    fn test_encode_command_words() {
        let bytes = encode_command(Command::SetShutterState, &[1]);
        assert_eq!(bytes, vec![0x72, 0xB6, 0xB6, 0x6B, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_parameters() {
        let params = DeviceParameters::parse(&params1(160, 120, 25), &params2(250)).unwrap();
        assert_eq!(params.serial_number, 0x0102_0304);
        assert_eq!(params.hardware_version, 0x0003_0201);
        assert_eq!(params.device_type, 3);
        assert_eq!(params.firmware_version, 42);
        assert_eq!((params.width, params.height, params.fps), (160, 120, 25));
        assert_eq!(params.fpa_gain, 7);
        assert_eq!(params.fpa_temp_fix, 250);
        assert_eq!(params.ffc_trigger_frame, 900);
        assert_eq!(params.ffc_trigger_temperature, 300);
        assert_eq!(params.at_error_slope, 1.5);
        assert_eq!(params.frame_packet_size(), 160 * 120 * 2 + 1024);
        assert_eq!(params.frame_interval(), Duration::from_millis(40));
    }

    #[test]
    fn test_parse_parameters_short_response() {
        let result = DeviceParameters::parse(&[0u8; 12], &params2(0));
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_calibration_size_accepted() {
        let info = CalibrationInfo::parse(&cali_info(50_000_000)).unwrap();
        assert_eq!(info.size, 50_000_000);
        assert_eq!(info.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_calibration_size_rejected() {
        assert!(matches!(
            CalibrationInfo::parse(&cali_info(100)),
            Err(ProtocolError::InvalidCalibrationSize(100))
        ));
        assert!(validate_calibration_size(CALIBRATION_SIZE_MIN).is_ok());
        assert!(validate_calibration_size(CALIBRATION_SIZE_MAX).is_err());
    }

    #[test]
    fn test_trailer_temperatures() {
        let packet = content(2, 2, 0, 9, 31_250);
        let trailer = FrameTrailer::parse(&packet[packet.len() - TRAILER_LEN..]).unwrap();
        assert_eq!(trailer.frame_index, 9);
        assert_eq!(trailer.dropped_interrupts, 2);
        for fix in [0u16, 120, 4000] {
            let expected = (31_250.0 + fix as f32) / 1000.0;
            assert!((trailer.fpa_temp_celsius(fix) - expected).abs() < 1e-4);
        }
        assert!((trailer.cam_temp_celsius(0) - 30.75).abs() < 1e-4);
    }

    #[test]
    fn test_trailer_wrong_code() {
        let mut packet = content(2, 2, 0, 1, 30_000);
        let len = packet.len();
        put_u32(&mut packet, len - TRAILER_LEN, IMG_START_CODE);
        let result = FrameTrailer::parse(&packet[len - TRAILER_LEN..]);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }
}
