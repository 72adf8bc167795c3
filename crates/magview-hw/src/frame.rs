//! Decoded sensor frames and the FFC reference frame.

use crate::protocol::{DeviceParameters, FrameTrailer, ProtocolError, TRAILER_LEN};
use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;
use std::sync::Arc;

/// One decoded sensor frame.
#[derive(Debug, Clone)]
pub struct FrameSample {
    /// Radiometric samples, `(height, width)`, promoted from `u16`.
    pub image: Array2<f32>,
    pub frame_index: u32,
    pub fpa_temp_raw: u32,
    pub dropped_interrupts: u32,
    pub cam_temp_celsius: f32,
    pub fpa_temp_celsius: f32,
}

impl FrameSample {
    /// Decode a content packet (image block followed by a 28-byte trailer).
    pub fn from_content_packet(
        content: &[u8],
        params: &DeviceParameters,
    ) -> Result<Self, ProtocolError> {
        if content.len() < TRAILER_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "content packet too short: {} bytes",
                content.len()
            )));
        }
        let (block, tail) = content.split_at(content.len() - TRAILER_LEN);
        let expected = params.image_block_len();
        if block.len() != expected {
            return Err(ProtocolError::MalformedPacket(format!(
                "image block: expected {expected} bytes, got {}",
                block.len()
            )));
        }
        let trailer = FrameTrailer::parse(tail)?;

        let image = decode_image_block(block, params.width as usize, params.height as usize)?;

        Ok(Self {
            image,
            frame_index: trailer.frame_index,
            fpa_temp_raw: trailer.fpa_temp_raw,
            dropped_interrupts: trailer.dropped_interrupts,
            cam_temp_celsius: trailer.cam_temp_celsius(params.fpa_temp_fix),
            fpa_temp_celsius: trailer.fpa_temp_celsius(params.fpa_temp_fix),
        })
    }

    /// Build a frame with the given image and neutral telemetry.
    pub fn synthetic(image: Array2<f32>) -> Self {
        Self {
            image,
            frame_index: 0,
            fpa_temp_raw: 0,
            dropped_interrupts: 0,
            cam_temp_celsius: 0.0,
            fpa_temp_celsius: 0.0,
        }
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }
}

/// Reinterpret a row-major little-endian `u16` block as a `(height, width)` array.
pub fn decode_image_block(
    block: &[u8],
    width: usize,
    height: usize,
) -> Result<Array2<f32>, ProtocolError> {
    let samples: Vec<f32> = block
        .chunks_exact(2)
        .map(|px| LittleEndian::read_u16(px) as f32)
        .collect();
    Array2::from_shape_vec((height, width), samples)
        .map_err(|e| ProtocolError::MalformedPacket(format!("image shape: {e}")))
}

/// Frame captured with the shutter closed. Replaced wholesale on each FFC.
#[derive(Debug, Clone)]
pub struct FfcReference {
    pub image: Arc<Array2<f32>>,
}

impl FfcReference {
    /// All-zero reference used until the first FFC completes.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            image: Arc::new(Array2::zeros((height, width))),
        }
    }

    pub fn from_frame(frame: &FrameSample) -> Self {
        Self {
            image: Arc::new(frame.image.clone()),
        }
    }

    pub fn mean(&self) -> f32 {
        self.image.mean().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_packets::{content, params1, params2};

    fn params(width: u32, height: u32) -> DeviceParameters {
        DeviceParameters::parse(&params1(width, height, 30), &params2(100)).unwrap()
    }

    #[test]
    fn test_decode_content_packet() {
        let params = params(4, 3);
        let frame = FrameSample::from_content_packet(&content(4, 3, 1234, 77, 30_000), &params)
            .unwrap();
        assert_eq!(frame.image.dim(), (3, 4));
        assert!(frame.image.iter().all(|&v| v == 1234.0));
        assert_eq!(frame.frame_index, 77);
        assert!((frame.fpa_temp_celsius - 30.1).abs() < 1e-4);
        assert!((frame.cam_temp_celsius - 29.6).abs() < 1e-4);
    }

    #[test]
    fn test_decode_row_major() {
        // 2x2 image: [1, 2; 3, 4]
        let block = [1u8, 0, 2, 0, 3, 0, 4, 0];
        let image = decode_image_block(&block, 2, 2).unwrap();
        assert_eq!(image[(0, 1)], 2.0);
        assert_eq!(image[(1, 0)], 3.0);
    }

    #[test]
    fn test_content_packet_wrong_length() {
        let params = params(4, 3);
        let mut packet = content(4, 3, 0, 1, 30_000);
        packet.remove(0);
        let result = FrameSample::from_content_packet(&packet, &params);
        assert!(matches!(result, Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_reference_mean() {
        let reference = FfcReference::from_frame(&FrameSample::synthetic(Array2::from_elem(
            (2, 2),
            800.0,
        )));
        assert_eq!(reference.mean(), 800.0);
        assert_eq!(FfcReference::zeros(3, 2).image.dim(), (2, 3));
    }
}
