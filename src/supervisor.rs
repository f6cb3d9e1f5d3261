//! The CAN supervisor: sole owner of the adapter transport.
//!
//! The loop drains control messages and the outbound bus, forwards received
//! frames to the worker registry, and re-discovers the device after a
//! disconnect. Losing the device for longer than [`RECONNECT_WINDOW`] is
//! fatal for the whole process; a silent stall would be worse.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serialport::SerialPort;

use crate::adapter::{self, Adapter, AdapterError};
use crate::discover::{find_device, DeviceFilter};
use crate::frame::CanFrame;
use crate::registry::Registry;

/// How long a vanished device is waited for before giving up
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(5);
/// Delay between discovery attempts while reconnecting
const RECONNECT_RETRY: Duration = Duration::from_millis(1);

/// Requests sent to the supervisor by the command router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlMsg {
    /// Change the CAN bus bitrate (kbaud); also becomes the bitrate
    /// reapplied after a reconnect.
    SetSpeed(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("CAN adapter lost and not found again within {}s", RECONNECT_WINDOW.as_secs())]
    DeviceLost,
}

pub struct Supervisor {
    adapter: Adapter<serialport::TTYPort>,
    filter: DeviceFilter,
    serial_baud: u32,
    /// Last applied CAN bitrate, reapplied after every reconnect
    speed: u32,
    outbound: Receiver<CanFrame>,
    ctrl: Receiver<CtrlMsg>,
    registry: Arc<Registry>,
}

impl Supervisor {
    /// Discovers and opens the adapter, applying the initial bitrate. Fails
    /// with [`SupervisorError::DeviceLost`] when no device shows up within
    /// the reconnect window.
    pub fn connect(
        filter: DeviceFilter,
        serial_baud: u32,
        speed: u32,
        outbound: Receiver<CanFrame>,
        ctrl: Receiver<CtrlMsg>,
        registry: Arc<Registry>,
    ) -> Result<Self, SupervisorError> {
        let adapter = reconnect(
            || open_from_filter(&filter, serial_baud),
            speed,
            RECONNECT_WINDOW,
        )?;
        Ok(Self {
            adapter,
            filter,
            serial_baud,
            speed,
            outbound,
            ctrl,
            registry,
        })
    }

    /// Runs forever; only a failed reconnect makes it return.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        loop {
            while let Ok(msg) = self.ctrl.try_recv() {
                match msg {
                    CtrlMsg::SetSpeed(kbaud) => self.apply_speed(kbaud)?,
                }
            }

            if let Ok(frame) = self.outbound.try_recv() {
                if let Err(err) = self.adapter.write_frame(&frame) {
                    log::warn!("can't write to CAN bus: {}", err);
                    self.reopen_if_disconnected()?;
                }
            }

            match self.adapter.read_frame() {
                Ok(Some(frame)) => {
                    log::debug!(
                        "frame from 0x{:03X}, len {}",
                        frame.raw_id(),
                        frame.dlc()
                    );
                    self.registry.dispatch(&frame);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("CAN read failed: {}", err);
                    self.reopen_if_disconnected()?;
                }
            }
        }
    }

    fn apply_speed(&mut self, kbaud: u32) -> Result<(), SupervisorError> {
        match self.adapter.set_speed(kbaud) {
            Ok(()) => {
                self.speed = kbaud;
                Ok(())
            }
            Err(AdapterError::SpeedRange(v)) => {
                // the router validates the range; a stray value is harmless
                log::warn!("refusing out-of-range bitrate {}", v);
                Ok(())
            }
            Err(err) => {
                log::warn!("can't set CAN bitrate: {}", err);
                self.reopen_if_disconnected()
            }
        }
    }

    fn reopen_if_disconnected(&mut self) -> Result<(), SupervisorError> {
        if !self.adapter.disconnected() {
            return Ok(());
        }
        log::warn!("adapter disconnected, rediscovering");
        self.adapter = reconnect(
            || open_from_filter(&self.filter, self.serial_baud),
            self.speed,
            RECONNECT_WINDOW,
        )?;
        log::info!("adapter reopened at {} kbaud", self.speed);
        Ok(())
    }
}

fn open_from_filter(
    filter: &DeviceFilter,
    serial_baud: u32,
) -> Option<Adapter<serialport::TTYPort>> {
    let path = find_device(filter)?;
    match adapter::open(&path, serial_baud) {
        Ok(adapter) => Some(adapter),
        Err(err) => {
            log::warn!("can't open {}: {}", path, err);
            None
        }
    }
}

/// The re-open loop: polls the port factory until it yields a working
/// adapter, then reapplies the saved bitrate. Gives up after `window`.
pub fn reconnect<P, F>(
    mut open_port: F,
    speed: u32,
    window: Duration,
) -> Result<Adapter<P>, SupervisorError>
where
    P: SerialPort,
    F: FnMut() -> Option<Adapter<P>>,
{
    let start = Instant::now();
    loop {
        if let Some(mut adapter) = open_port() {
            match adapter.set_speed(speed) {
                Ok(()) => return Ok(adapter),
                Err(err) => log::warn!("bitrate after reopen failed: {}", err),
            }
        }
        if start.elapsed() >= window {
            return Err(SupervisorError::DeviceLost);
        }
        std::thread::sleep(RECONNECT_RETRY);
    }
}
