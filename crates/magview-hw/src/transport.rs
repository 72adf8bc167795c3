//! Raw USB bulk transport.
//!
//! [`NusbTransport`] talks to real hardware via `nusb`; [`MockTransport`]
//! replays scripted packets so the driver can be exercised without a device.

use crate::protocol::{self, endpoint, ProtocolError, Response, RESPONSE_LEN};
use nusb::transfer::RequestBuffer;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bulk read/write against fixed endpoint addresses.
pub trait UsbTransport: Send {
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, ProtocolError>;

    /// Read at most `max_len` bytes; returns the bytes actually transferred.
    fn read_bulk(&mut self, endpoint: u8, max_len: usize, timeout: Duration)
        -> Result<Vec<u8>, ProtocolError>;

    /// Release the claimed interface. Calling it again is a no-op.
    fn release(&mut self);
}

/// `nusb`-backed transport owning the claimed interface.
pub struct NusbTransport {
    interface: Option<nusb::Interface>,
    /// Drives transfer futures and their timeouts on the calling thread.
    runtime: tokio::runtime::Runtime,
}

impl NusbTransport {
    /// Open the first device matching `vid:pid`, claim interface 0 and check
    /// that all protocol endpoints are present.
    pub fn open(vid: u16, pid: u16) -> Result<Self, ProtocolError> {
        let info = nusb::list_devices()
            .map_err(|e| ProtocolError::Usb(format!("failed to enumerate devices: {e}")))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(ProtocolError::DeviceNotFound { vid, pid })?;

        let device = info
            .open()
            .map_err(|e| ProtocolError::Usb(format!("failed to open {vid:04x}:{pid:04x}: {e}")))?;

        if let Err(e) = device.set_configuration(1) {
            // Already-configured devices may refuse; the active configuration is checked below.
            tracing::debug!(error = %e, "set_configuration failed");
        }

        let addresses: Vec<u8> = {
            let config = device
                .active_configuration()
                .map_err(|e| ProtocolError::Usb(format!("no active configuration: {e}")))?;
            config
                .interface_alt_settings()
                .filter(|alt| alt.interface_number() == protocol::INTERFACE)
                .flat_map(|alt| alt.endpoints().map(|ep| ep.address()).collect::<Vec<_>>())
                .collect()
        };
        if let Some(missing) = endpoint::ALL.iter().find(|ep| !addresses.contains(ep)) {
            return Err(ProtocolError::EndpointResolutionFailed(*missing));
        }

        let interface = device
            .claim_interface(protocol::INTERFACE)
            .map_err(|e| ProtocolError::Usb(format!("failed to claim interface: {e}")))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| ProtocolError::Usb(format!("failed to start transfer runtime: {e}")))?;

        tracing::info!(
            vid = format_args!("{vid:04x}"),
            pid = format_args!("{pid:04x}"),
            endpoints = ?addresses,
            "opened thermal sensor"
        );

        Ok(Self {
            interface: Some(interface),
            runtime,
        })
    }

    fn interface(&self) -> Result<&nusb::Interface, ProtocolError> {
        self.interface
            .as_ref()
            .ok_or_else(|| ProtocolError::Usb("interface released".into()))
    }
}

impl UsbTransport for NusbTransport {
    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ProtocolError> {
        let transfer = self.interface()?.bulk_out(endpoint, data.to_vec());
        let completion = self
            .runtime
            .block_on(tokio::time::timeout(timeout, transfer))
            .map_err(|_| ProtocolError::CommandTimeout {
                operation: "bulk write",
                endpoint,
            })?;
        let sent = completion
            .into_result()
            .map_err(|e| ProtocolError::Usb(format!("bulk write {endpoint:#04x}: {e}")))?;
        Ok(sent.actual_length())
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let transfer = self
            .interface()?
            .bulk_in(endpoint, RequestBuffer::new(max_len));
        let completion = self
            .runtime
            .block_on(tokio::time::timeout(timeout, transfer))
            .map_err(|_| ProtocolError::CommandTimeout {
                operation: "bulk read",
                endpoint,
            })?;
        completion
            .into_result()
            .map_err(|e| ProtocolError::Usb(format!("bulk read {endpoint:#04x}: {e}")))
    }

    fn release(&mut self) {
        if self.interface.take().is_some() {
            tracing::debug!("released interface");
        }
    }
}

enum Scripted {
    Data(Vec<u8>),
    Timeout,
}

#[derive(Default)]
struct MockState {
    reads: HashMap<u8, VecDeque<Scripted>>,
    writes: Vec<(u8, Vec<u8>)>,
    released: bool,
    ack_commands: bool,
}

/// In-memory transport replaying scripted reads and recording writes.
///
/// Clones share state, so a test can keep one handle for inspection after
/// moving another into the driver. An empty read queue behaves like a
/// timeout, except on command-in when command acks are enabled.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer unscripted command-in reads with `CmdHandledAck`.
    pub fn with_command_acks(self) -> Self {
        self.lock().ack_commands = true;
        self
    }

    pub fn queue_read(&self, endpoint: u8, data: Vec<u8>) {
        self.lock()
            .reads
            .entry(endpoint)
            .or_default()
            .push_back(Scripted::Data(data));
    }

    pub fn queue_timeout(&self, endpoint: u8) {
        self.lock()
            .reads
            .entry(endpoint)
            .or_default()
            .push_back(Scripted::Timeout);
    }

    /// All writes so far, as `(endpoint, bytes)`.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn released(&self) -> bool {
        self.lock().released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic in another test thread must not hide this test's assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UsbTransport for MockTransport {
    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, ProtocolError> {
        let mut state = self.lock();
        if state.released {
            return Err(ProtocolError::Usb("interface released".into()));
        }
        state.writes.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        if state.released {
            return Err(ProtocolError::Usb("interface released".into()));
        }
        let ack = state.ack_commands && endpoint == endpoint::COMMAND_IN;
        match state.reads.get_mut(&endpoint).and_then(|q| q.pop_front()) {
            Some(Scripted::Data(mut data)) => {
                data.truncate(max_len);
                Ok(data)
            }
            None if ack => {
                let mut packet = vec![0u8; RESPONSE_LEN];
                packet[..4].copy_from_slice(&(Response::CmdHandledAck as u32).to_le_bytes());
                Ok(packet)
            }
            Some(Scripted::Timeout) | None => Err(ProtocolError::CommandTimeout {
                operation: "bulk read",
                endpoint,
            }),
        }
    }

    fn release(&mut self) {
        self.lock().released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_replays_in_order() {
        let mock = MockTransport::new();
        mock.queue_read(0x81, vec![1, 2, 3]);
        mock.queue_read(0x81, vec![4]);
        let mut transport = mock.clone();
        let t = Duration::from_millis(10);
        assert_eq!(transport.read_bulk(0x81, 64, t).unwrap(), vec![1, 2, 3]);
        assert_eq!(transport.read_bulk(0x81, 64, t).unwrap(), vec![4]);
        assert!(matches!(
            transport.read_bulk(0x81, 64, t),
            Err(ProtocolError::CommandTimeout { endpoint: 0x81, .. })
        ));
    }

    #[test]
    fn test_mock_records_writes_and_release() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        transport.write_bulk(0x03, &[9, 9], Duration::ZERO).unwrap();
        transport.release();
        transport.release();
        assert_eq!(mock.writes(), vec![(0x03, vec![9, 9])]);
        assert!(mock.released());
        assert!(transport.write_bulk(0x03, &[1], Duration::ZERO).is_err());
    }

    #[test]
    fn test_mock_command_acks() {
        let mut transport = MockTransport::new().with_command_acks();
        let packet = transport
            .read_bulk(endpoint::COMMAND_IN, RESPONSE_LEN, Duration::ZERO)
            .unwrap();
        assert_eq!(protocol::packet_code(&packet), Some(Response::CmdHandledAck as u32));
    }
}
