//! MAG-160 Core protocol driver and flat-field-correction state machine.

use crate::clock::{Clock, SystemClock};
use crate::frame::{FfcReference, FrameSample};
use crate::observer::FfcObservers;
use crate::protocol::{
    self, encode_command, endpoint, packet_code, CalibrationInfo, Command, DeviceParameters,
    ProtocolError, Response, CALIBRATION_CHUNK, CMD_TIMEOUT, FRAME_TIMEOUT, IMG_START_CODE,
    RESPONSE_LEN, TRAILER_LEN, TRANSFER_TOGGLE_TIMEOUT,
};
use crate::transport::{NusbTransport, UsbTransport};
use std::sync::Arc;
use std::time::Duration;

/// FPA temperature drift (°C) since the last FFC that triggers a new one.
pub const FFC_TEMP_DELTA: f32 = 0.3;
/// Time the closed shutter is given to settle before the reference is taken.
pub const FFC_SETTLE: Duration = Duration::from_millis(410);
/// Time the shutter is given to reopen before frames are trusted again.
pub const FFC_REOPEN: Duration = Duration::from_millis(140);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfcState {
    Idle,
    /// Shutter closed at `since`; waiting for it to settle.
    Triggering { since: Duration },
    /// Reference captured and shutter reopened at `since`.
    Settling { since: Duration },
}

/// Immutable view of the driver handed to the rendering side.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub frame: Option<Arc<FrameSample>>,
    pub reference: FfcReference,
    pub performing_ffc: bool,
}

/// Capability interface implemented per sensor family.
pub trait ThermalDevice: Send {
    fn name(&self) -> &str;
    fn parameters(&self) -> &DeviceParameters;

    /// Read one frame. Blocks for up to the frame timeout; not reentrant.
    fn read_frame(&mut self) -> Result<Arc<FrameSample>, ProtocolError>;

    /// Start an FFC if `force` is set or the FPA temperature drifted.
    /// Returns whether a new FFC was started.
    fn trigger_ffc(&mut self, force: bool) -> Result<bool, ProtocolError>;

    /// Advance the FFC state machine against the device clock.
    fn tick_ffc(&mut self) -> Result<(), ProtocolError>;

    fn set_shutter(&mut self, open: bool) -> Result<(), ProtocolError>;

    /// Stop image transfer and release the device. Idempotent.
    fn close(&mut self);

    fn ffc_state(&self) -> FfcState;

    fn performing_ffc(&self) -> bool {
        self.ffc_state() != FfcState::Idle
    }

    /// Clock time of the last completed reference capture.
    fn last_ffc_at(&self) -> Option<Duration>;

    fn now(&self) -> Duration;

    fn ffc_observers(&mut self) -> &mut FfcObservers;

    fn snapshot(&self) -> DeviceSnapshot;

    fn calibration_info(&mut self) -> Result<CalibrationInfo, ProtocolError>;

    fn download_calibration(&mut self) -> Result<Vec<u8>, ProtocolError>;
}

/// Command channel over the transport: write the framed command, then read
/// the 64-byte response from command-in.
struct Link<T, C> {
    transport: T,
    clock: C,
    response_delay: Duration,
}

impl<T: UsbTransport, C: Clock> Link<T, C> {
    fn send(&mut self, command: Command, args: &[u32], timeout: Duration) -> Result<(), ProtocolError> {
        let bytes = encode_command(command, args);
        tracing::trace!(?command, ?args, "send command");
        self.transport
            .write_bulk(endpoint::COMMAND_OUT, &bytes, timeout)?;
        Ok(())
    }

    fn request(
        &mut self,
        command: Command,
        args: &[u32],
        timeout: Duration,
        expect: Response,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.send(command, args, timeout)?;
        if !self.response_delay.is_zero() {
            self.clock.sleep(self.response_delay);
        }
        let response = self
            .transport
            .read_bulk(endpoint::COMMAND_IN, RESPONSE_LEN, timeout)?;
        let code = packet_code(&response);
        if code != Some(expect as u32) {
            tracing::warn!(
                ?command,
                expected = format_args!("{:#010x}", expect as u32),
                got = ?code.map(|c| format!("{c:#010x}")),
                "unexpected response code"
            );
        }
        Ok(response)
    }
}

/// Driver for the MAG-160 Core sensor.
pub struct Mag160Core<T: UsbTransport = NusbTransport, C: Clock = SystemClock> {
    link: Link<T, C>,
    params: DeviceParameters,
    calibration: CalibrationInfo,
    latest: Option<Arc<FrameSample>>,
    reference: FfcReference,
    state: FfcState,
    last_ffc_temp: f32,
    last_ffc_at: Option<Duration>,
    /// Reference already taken for the FFC in progress; only the
    /// shutter-open command is still outstanding.
    reference_captured: bool,
    observers: FfcObservers,
    closed: bool,
}

impl Mag160Core {
    /// Open the sensor over USB and run the connect handshake.
    pub fn connect() -> Result<Self, ProtocolError> {
        let transport = NusbTransport::open(protocol::VENDOR_ID, protocol::PRODUCT_ID)?;
        Self::connect_with(transport, SystemClock::new())
    }
}

impl<T: UsbTransport, C: Clock> Mag160Core<T, C> {
    /// Run the connect handshake over an already opened transport.
    ///
    /// Reads both parameter blocks, validates the calibration info and starts
    /// image transfer. On failure the transport is released and nothing is
    /// returned.
    pub fn connect_with(transport: T, clock: C) -> Result<Self, ProtocolError> {
        let mut link = Link {
            transport,
            clock,
            response_delay: Duration::ZERO,
        };

        let (params, calibration) = match Self::handshake(&mut link) {
            Ok(v) => v,
            Err(e) => {
                link.transport.release();
                return Err(e);
            }
        };

        tracing::info!(
            serial = params.serial_number,
            firmware = params.firmware_version,
            width = params.width,
            height = params.height,
            fps = params.fps,
            calibration_size = calibration.size,
            "sensor connected"
        );

        let reference = FfcReference::zeros(params.width as usize, params.height as usize);
        Ok(Self {
            link,
            params,
            calibration,
            latest: None,
            reference,
            state: FfcState::Idle,
            last_ffc_temp: 0.0,
            last_ffc_at: None,
            reference_captured: false,
            observers: FfcObservers::new(),
            closed: false,
        })
    }

    fn handshake(
        link: &mut Link<T, C>,
    ) -> Result<(DeviceParameters, CalibrationInfo), ProtocolError> {
        let params1 = link.request(Command::GetParameter1, &[], CMD_TIMEOUT, Response::SendParameter1)?;
        let params2 = link.request(Command::GetParameter2, &[], CMD_TIMEOUT, Response::SendParameter2)?;
        let params = DeviceParameters::parse(&params1, &params2)?;
        if params.width == 0 || params.height == 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "sensor reported {}x{}",
                params.width, params.height
            )));
        }

        let info = link.request(Command::GetCaliInfo, &[], CMD_TIMEOUT, Response::SendCaliInfo)?;
        let calibration = CalibrationInfo::parse(&info)?;

        link.request(
            Command::StartTransferImg,
            &[],
            TRANSFER_TOGGLE_TIMEOUT,
            Response::CmdHandledAck,
        )?;
        Ok((params, calibration))
    }

    /// Calibration info read during connect.
    pub fn connected_calibration(&self) -> &CalibrationInfo {
        &self.calibration
    }

    pub fn latest_frame(&self) -> Option<&Arc<FrameSample>> {
        self.latest.as_ref()
    }

    pub fn ffc_reference(&self) -> &FfcReference {
        &self.reference
    }

    /// Trigger an FFC and drive it to completion, reading frames while the
    /// shutter is closed. Stalls the caller for roughly 550 ms.
    pub fn run_ffc(&mut self, force: bool) -> Result<bool, ProtocolError> {
        if !self.trigger_ffc(force)? {
            return Ok(false);
        }
        let poll = self.params.frame_interval();
        while self.performing_ffc() {
            self.link.clock.sleep(poll);
            if let Err(e) = self.read_frame() {
                tracing::debug!(error = %e, "frame read during FFC failed");
            }
            self.tick_ffc()?;
        }
        Ok(true)
    }

    fn temperature_drifted(&self) -> bool {
        self.latest
            .as_ref()
            .map(|f| (f.fpa_temp_celsius - self.last_ffc_temp).abs() > FFC_TEMP_DELTA)
            .unwrap_or(false)
    }

    fn capture_reference(&mut self, now: Duration) {
        match &self.latest {
            Some(frame) => {
                self.reference = FfcReference::from_frame(frame);
                self.last_ffc_temp = frame.fpa_temp_celsius;
                tracing::info!(
                    frame = frame.frame_index,
                    fpa_temp = frame.fpa_temp_celsius,
                    "FFC reference captured"
                );
            }
            None => tracing::warn!("no frame available; keeping previous FFC reference"),
        }
        self.last_ffc_at = Some(now);
        self.observers.notify(&self.reference);
    }
}

impl<T: UsbTransport, C: Clock> ThermalDevice for Mag160Core<T, C> {
    fn name(&self) -> &str {
        "MAG-160 Core"
    }

    fn parameters(&self) -> &DeviceParameters {
        &self.params
    }

    fn read_frame(&mut self) -> Result<Arc<FrameSample>, ProtocolError> {
        let len = self.params.frame_packet_size();
        let content_len = self.params.image_block_len() + TRAILER_LEN;

        let first = self
            .link
            .transport
            .read_bulk(endpoint::IMAGE_IN, len, FRAME_TIMEOUT)?;
        let content = if first.len() == content_len {
            // Header was lost; this is already the content packet.
            tracing::debug!("image header missing, resynchronized on content packet");
            first
        } else {
            if packet_code(&first) != Some(IMG_START_CODE) {
                tracing::trace!(len = first.len(), "unexpected image header code");
            }
            self.link
                .transport
                .read_bulk(endpoint::IMAGE_IN, len, FRAME_TIMEOUT)?
        };

        let frame = Arc::new(FrameSample::from_content_packet(&content, &self.params)?);
        if frame.dropped_interrupts > 0 {
            tracing::trace!(
                frame = frame.frame_index,
                dropped = frame.dropped_interrupts,
                "sensor reported dropped interrupts"
            );
        }
        self.latest = Some(frame.clone());
        Ok(frame)
    }

    fn trigger_ffc(&mut self, force: bool) -> Result<bool, ProtocolError> {
        if self.state != FfcState::Idle {
            return Ok(false);
        }
        if !force && !self.temperature_drifted() {
            return Ok(false);
        }

        self.set_shutter(false)?;
        let now = self.link.clock.now();
        self.reference_captured = false;
        self.state = FfcState::Triggering { since: now };
        tracing::debug!(force, last_ffc_temp = self.last_ffc_temp, "FFC triggered");
        Ok(true)
    }

    fn tick_ffc(&mut self) -> Result<(), ProtocolError> {
        let now = self.link.clock.now();
        match self.state {
            FfcState::Idle => {}
            FfcState::Triggering { since } if now.saturating_sub(since) >= FFC_SETTLE => {
                if !self.reference_captured {
                    self.capture_reference(now);
                    self.reference_captured = true;
                }
                // On failure we stay in Triggering and the next tick only retries the open.
                self.set_shutter(true)?;
                self.reference_captured = false;
                self.state = FfcState::Settling { since: now };
            }
            FfcState::Settling { since } if now.saturating_sub(since) >= FFC_REOPEN => {
                self.state = FfcState::Idle;
                tracing::debug!("FFC complete");
            }
            FfcState::Triggering { .. } | FfcState::Settling { .. } => {}
        }
        Ok(())
    }

    fn set_shutter(&mut self, open: bool) -> Result<(), ProtocolError> {
        // Wire word is the negation of the device's "closed" flag: 0 closes, 1 opens.
        self.link.request(
            Command::SetShutterState,
            &[u32::from(open)],
            CMD_TIMEOUT,
            Response::CmdHandledAck,
        )?;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = FfcState::Idle;
        if let Err(e) = self
            .link
            .send(Command::StopTransferImg, &[], TRANSFER_TOGGLE_TIMEOUT)
        {
            tracing::warn!(error = %e, "failed to stop image transfer");
        }
        self.link.transport.release();
        tracing::info!("sensor closed");
    }

    fn ffc_state(&self) -> FfcState {
        self.state
    }

    fn last_ffc_at(&self) -> Option<Duration> {
        self.last_ffc_at
    }

    fn now(&self) -> Duration {
        self.link.clock.now()
    }

    fn ffc_observers(&mut self) -> &mut FfcObservers {
        &mut self.observers
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            frame: self.latest.clone(),
            reference: self.reference.clone(),
            performing_ffc: self.performing_ffc(),
        }
    }

    fn calibration_info(&mut self) -> Result<CalibrationInfo, ProtocolError> {
        let info = self
            .link
            .request(Command::GetCaliInfo, &[], CMD_TIMEOUT, Response::SendCaliInfo)?;
        CalibrationInfo::parse(&info)
    }

    fn download_calibration(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let size = self.calibration_info()?.size as usize;
        self.link
            .request(Command::GetCaliFile, &[], CMD_TIMEOUT, Response::SendCaliFile)?;

        let mut blob = Vec::with_capacity(size);
        while blob.len() < size {
            let want = (size - blob.len()).min(CALIBRATION_CHUNK);
            let chunk = self
                .link
                .transport
                .read_bulk(endpoint::CALIBRATION_IN, want, CMD_TIMEOUT)?;
            if chunk.is_empty() {
                return Err(ProtocolError::MalformedPacket(format!(
                    "empty calibration chunk after {} of {size} bytes",
                    blob.len()
                )));
            }
            blob.extend_from_slice(&chunk[..chunk.len().min(want)]);
        }
        tracing::info!(bytes = blob.len(), "calibration blob downloaded");
        Ok(blob)
    }
}

impl<T: UsbTransport, C: Clock> Drop for Mag160Core<T, C> {
    fn drop(&mut self) {
        self.close();
    }
}
