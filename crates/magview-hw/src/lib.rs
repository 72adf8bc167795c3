//! magview-hw — USB transport and protocol driver for MAG-160 Core thermal sensors.
//!
//! Provides bulk-endpoint access via `nusb`, command/image packet decoding,
//! and a flat-field-correction state machine driven by an injectable clock.

pub mod clock;
pub mod driver;
pub mod frame;
pub mod observer;
pub mod protocol;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{DeviceSnapshot, FfcState, Mag160Core, ThermalDevice};
pub use frame::{FfcReference, FrameSample};
pub use observer::{FfcObservers, ObserverId};
pub use protocol::{CalibrationInfo, DeviceParameters, ProtocolError};
pub use transport::{MockTransport, NusbTransport, UsbTransport};
