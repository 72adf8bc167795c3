use magview_core::{FfcController, PipelineError};
use magview_hw::{
    CalibrationInfo, DeviceParameters, DeviceSnapshot, FfcReference, ProtocolError, ThermalDevice,
};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("device error: {0}")]
    Device(#[from] ProtocolError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// When the engine starts an FFC on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfcMode {
    /// Only on explicit request.
    Manual,
    /// When the FPA temperature drifts past the driver threshold.
    Temperature,
    /// Every `ffc_interval`.
    Interval,
}

impl FromStr for FfcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "temperature" | "temp" => Ok(Self::Temperature),
            "interval" | "time" => Ok(Self::Interval),
            other => Err(format!(
                "unknown FFC mode '{other}' (expected manual, temperature or interval)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub ffc_mode: FfcMode,
    pub ffc_interval: Duration,
}

type FfcCallback = Box<dyn FnOnce(&FfcReference) + Send>;

/// Messages sent from the consumer side to the engine thread.
enum EngineRequest {
    TriggerFfc {
        force: bool,
        reply: Option<oneshot::Sender<Result<bool, EngineError>>>,
    },
    OnNextFfc(FfcCallback),
    CalibrationInfo {
        reply: oneshot::Sender<Result<CalibrationInfo, EngineError>>,
    },
    Shutdown,
}

/// Handle to the acquisition thread.
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    snapshots: watch::Receiver<DeviceSnapshot>,
    parameters: DeviceParameters,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EngineHandle {
    pub fn parameters(&self) -> &DeviceParameters {
        &self.parameters
    }

    /// Receiver for snapshots published after every acquisition tick.
    pub fn snapshots(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshots.clone()
    }

    pub async fn trigger_ffc(&self, force: bool) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::TriggerFfc {
                force,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn calibration_info(&self) -> Result<CalibrationInfo, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::CalibrationInfo { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop acquisition, close the device and wait for the thread to exit.
    pub async fn shutdown(mut self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

impl FfcController for EngineHandle {
    fn on_next_ffc(&mut self, callback: FfcCallback) -> Result<(), PipelineError> {
        self.tx
            .try_send(EngineRequest::OnNextFfc(callback))
            .map_err(|e| PipelineError::FfcRequest(e.to_string()))
    }

    fn request_ffc(&mut self) -> Result<(), PipelineError> {
        self.tx
            .try_send(EngineRequest::TriggerFfc {
                force: true,
                reply: None,
            })
            .map_err(|e| PipelineError::FfcRequest(e.to_string()))
    }
}

/// Spawn the acquisition loop on a dedicated OS thread.
///
/// The thread exclusively owns `device`. Every frame period it drains
/// pending requests, reads a frame, applies the FFC policy, advances the FFC
/// state machine and publishes a snapshot.
pub fn spawn_engine<D>(device: D, options: EngineOptions) -> Result<EngineHandle, EngineError>
where
    D: ThermalDevice + 'static,
{
    let parameters = device.parameters().clone();
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (snapshot_tx, snapshot_rx) = watch::channel(device.snapshot());

    tracing::info!(
        device = device.name(),
        fps = parameters.fps,
        ffc_mode = ?options.ffc_mode,
        "starting acquisition"
    );

    let thread = std::thread::Builder::new()
        .name("magview-engine".into())
        .spawn(move || run(device, options, rx, snapshot_tx))?;

    Ok(EngineHandle {
        tx,
        snapshots: snapshot_rx,
        parameters,
        thread: Some(thread),
    })
}

fn run<D: ThermalDevice>(
    mut device: D,
    options: EngineOptions,
    mut rx: mpsc::Receiver<EngineRequest>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
) {
    tracing::info!("engine thread started");
    let period = device.parameters().frame_interval();
    let mut next = Instant::now();

    'acquire: loop {
        loop {
            match rx.try_recv() {
                Ok(EngineRequest::Shutdown) | Err(TryRecvError::Disconnected) => break 'acquire,
                Ok(request) => handle_request(&mut device, request),
                Err(TryRecvError::Empty) => break,
            }
        }

        if let Err(e) = device.read_frame() {
            tracing::warn!(error = %e, "frame read failed");
        }
        if let Err(e) = apply_policy(&mut device, &options) {
            tracing::warn!(error = %e, "automatic FFC failed");
        }
        if let Err(e) = device.tick_ffc() {
            tracing::warn!(error = %e, "FFC step failed");
        }
        snapshot_tx.send_replace(device.snapshot());

        next += period;
        let now = Instant::now();
        match next.checked_duration_since(now) {
            Some(wait) => std::thread::sleep(wait),
            None => next = now,
        }
    }

    device.close();
    tracing::info!("engine thread exiting");
}

fn handle_request<D: ThermalDevice>(device: &mut D, request: EngineRequest) {
    match request {
        EngineRequest::TriggerFfc { force, reply } => {
            let result = device.trigger_ffc(force).map_err(EngineError::from);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "FFC request failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        EngineRequest::OnNextFfc(callback) => {
            device.ffc_observers().subscribe_once(callback);
        }
        EngineRequest::CalibrationInfo { reply } => {
            let _ = reply.send(device.calibration_info().map_err(EngineError::from));
        }
        EngineRequest::Shutdown => {}
    }
}

fn apply_policy<D: ThermalDevice>(device: &mut D, options: &EngineOptions) -> Result<(), ProtocolError> {
    match options.ffc_mode {
        FfcMode::Manual => {}
        FfcMode::Temperature => {
            device.trigger_ffc(false)?;
        }
        FfcMode::Interval => {
            let due = device
                .last_ffc_at()
                .map_or(true, |at| device.now().saturating_sub(at) >= options.ffc_interval);
            if due && !device.performing_ffc() {
                device.trigger_ffc(true)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use magview_hw::{FfcObservers, FfcState, FrameSample};
    use ndarray::Array2;
    use std::sync::{Arc, Mutex};

    /// In-memory device producing constant frames. FFC completes on the next tick.
    struct FakeDevice {
        params: DeviceParameters,
        latest: Option<Arc<FrameSample>>,
        reference: FfcReference,
        state: FfcState,
        started: Instant,
        last_ffc_at: Option<Duration>,
        observers: FfcObservers,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FakeDevice {
        fn new(log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                params: DeviceParameters {
                    width: 4,
                    height: 3,
                    fps: 200,
                    ..Default::default()
                },
                latest: None,
                reference: FfcReference::zeros(4, 3),
                state: FfcState::Idle,
                started: Instant::now(),
                last_ffc_at: None,
                observers: FfcObservers::new(),
                log,
            }
        }
    }

    impl ThermalDevice for FakeDevice {
        fn name(&self) -> &str {
            "fake"
        }

        fn parameters(&self) -> &DeviceParameters {
            &self.params
        }

        fn read_frame(&mut self) -> Result<Arc<FrameSample>, ProtocolError> {
            let frame = Arc::new(FrameSample::synthetic(Array2::from_elem((3, 4), 1000.0)));
            self.latest = Some(frame.clone());
            Ok(frame)
        }

        fn trigger_ffc(&mut self, force: bool) -> Result<bool, ProtocolError> {
            if !force || self.state != FfcState::Idle {
                return Ok(false);
            }
            self.log.lock().unwrap().push("trigger");
            self.state = FfcState::Triggering { since: self.now() };
            Ok(true)
        }

        fn tick_ffc(&mut self) -> Result<(), ProtocolError> {
            if let FfcState::Triggering { .. } = self.state {
                if let Some(frame) = &self.latest {
                    self.reference = FfcReference::from_frame(frame);
                }
                self.last_ffc_at = Some(self.now());
                self.observers.notify(&self.reference);
                self.state = FfcState::Idle;
            }
            Ok(())
        }

        fn set_shutter(&mut self, _open: bool) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().push("close");
        }

        fn ffc_state(&self) -> FfcState {
            self.state
        }

        fn last_ffc_at(&self) -> Option<Duration> {
            self.last_ffc_at
        }

        fn now(&self) -> Duration {
            self.started.elapsed()
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
            Err(ProtocolError::InvalidCalibrationSize(0))
        }

        fn download_calibration(&mut self) -> Result<Vec<u8>, ProtocolError> {
            Err(ProtocolError::InvalidCalibrationSize(0))
        }
    }

    fn manual() -> EngineOptions {
        EngineOptions {
            ffc_mode: FfcMode::Manual,
            ffc_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_parse_ffc_mode() {
        assert_eq!("Manual".parse::<FfcMode>().unwrap(), FfcMode::Manual);
        assert_eq!("temperature".parse::<FfcMode>().unwrap(), FfcMode::Temperature);
        assert_eq!("interval".parse::<FfcMode>().unwrap(), FfcMode::Interval);
        assert!("sometimes".parse::<FfcMode>().is_err());
    }

    #[tokio::test]
    async fn test_engine_publishes_snapshots() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_engine(FakeDevice::new(log.clone()), manual()).unwrap();
        assert_eq!(handle.parameters().width, 4);

        let mut rx = handle.snapshots();
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        let frame = snapshot.frame.expect("frame published");
        assert_eq!(frame.image.dim(), (3, 4));

        handle.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_ffc_request_and_notification() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn_engine(FakeDevice::new(log.clone()), manual()).unwrap();

        let (seen_tx, seen_rx) = oneshot::channel();
        let mut seen_tx = Some(seen_tx);
        handle
            .on_next_ffc(Box::new(move |reference| {
                if let Some(tx) = seen_tx.take() {
                    let _ = tx.send(reference.mean());
                }
            }))
            .unwrap();
        assert!(handle.trigger_ffc(true).await.unwrap());

        let mean = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mean, 1000.0);

        handle.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec!["trigger", "close"]);
    }

    #[tokio::test]
    async fn test_interval_mode_triggers_first_ffc() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let options = EngineOptions {
            ffc_mode: FfcMode::Interval,
            ffc_interval: Duration::from_secs(3600),
        };
        let handle = spawn_engine(FakeDevice::new(log.clone()), options).unwrap();
        let mut rx = handle.snapshots();
        for _ in 0..3 {
            rx.changed().await.unwrap();
        }
        handle.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec!["trigger", "close"]);
    }

    #[tokio::test]
    async fn test_calibration_error_is_returned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_engine(FakeDevice::new(log), manual()).unwrap();
        assert!(matches!(
            handle.calibration_info().await,
            Err(EngineError::Device(ProtocolError::InvalidCalibrationSize(0)))
        ));
        handle.shutdown().await;
    }
}
