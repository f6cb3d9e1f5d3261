//! Serial transport to the USB-CAN adapter.
//!
//! The adapter speaks one ASCII command per `\n`-terminated line and echoes
//! every command back on a line of its own before any other output.
//! Asynchronously received CAN frames arrive as `<ms> #0x<ID> 0x<b0> …`
//! lines in between.

use std::io;
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::command::Command;
use crate::frame::CanFrame;
use crate::parser::parse_frame_from_line;

/// Per-chunk serial read timeout
const CHUNK_TIMEOUT: Duration = Duration::from_micros(500);
/// A started line is abandoned when the device stays idle this long
const IDLE_TIMEOUT: Duration = Duration::from_millis(10);
/// Total wait of one [`Adapter::read_frame`] call
pub const T_POLLING_TMOUT: Duration = Duration::from_millis(500);
/// Crossing-traffic lines tolerated while waiting for a command echo
const ECHO_SPURIOUS_MAX: u32 = 3;

/// Valid CAN bitrate range in kbaud (0 means "do not change")
pub const CAN_SPEED_RANGE: std::ops::RangeInclusive<u32> = 10..=3000;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("adapter disconnected")]
    Disconnected,
    #[error("CAN bitrate {0} kbaud is out of the 10..=3000 range")]
    SpeedRange(u32),
    #[error("adapter did not echo command {0:?}")]
    Echo(String),
}

/// Represents the interface into the CAN network through a serial (USB)
/// adapter device.
///
/// The transport is owned exclusively by the CAN supervisor, which
/// serialises all reads and writes; no internal locking is needed.
pub struct Adapter<P: SerialPort> {
    port: P,
    /// Bytes received past the first newline of the previous read
    carry: Vec<u8>,
    disconnected: bool,
}

/// Opens the serial device in blocking mode at the given UART baud rate.
#[cfg(unix)]
pub fn open(path: &str, baud: u32) -> Result<Adapter<serialport::TTYPort>, AdapterError> {
    let port = serialport::TTYPort::open(&serialport::new(path, baud))?;
    Adapter::new(port)
}

impl<P: SerialPort> Adapter<P> {
    /// Wraps an already opened serial port.
    pub fn new(mut port: P) -> Result<Self, AdapterError> {
        port.set_timeout(CHUNK_TIMEOUT)?;
        Ok(Self {
            port,
            carry: Vec::new(),
            disconnected: false,
        })
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    /// Applies a CAN bus bitrate. A bitrate of 0 leaves the bus unchanged;
    /// informational follow-up lines from the device are drained.
    pub fn set_speed(&mut self, kbaud: u32) -> Result<(), AdapterError> {
        if kbaud == 0 {
            return Ok(());
        }
        if !CAN_SPEED_RANGE.contains(&kbaud) {
            return Err(AdapterError::SpeedRange(kbaud));
        }
        self.clear()?;
        self.write_line(&Command::SetBitRate(kbaud).as_line())?;
        self.clear()
    }

    /// Transmits one CAN frame through the adapter.
    pub fn write_frame(&mut self, frame: &CanFrame) -> Result<(), AdapterError> {
        self.clear()?;
        self.write_line(&Command::TransmitFrame(frame.clone()).as_line())
    }

    /// Waits up to [`T_POLLING_TMOUT`] for any incoming frame. Informational
    /// lines are skipped; the first parsable frame is returned regardless of
    /// its identifier.
    pub fn read_frame(&mut self) -> Result<Option<CanFrame>, AdapterError> {
        let start = Instant::now();
        loop {
            if let Some(line) = self.read_line()? {
                match parse_frame_from_line(&line) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => log::debug!("ignoring adapter line {:?}: {}", line, err),
                }
            }
            if start.elapsed() >= T_POLLING_TMOUT {
                return Ok(None);
            }
        }
    }

    /// Drops everything currently pending on the RX side.
    pub fn clear(&mut self) -> Result<(), AdapterError> {
        if self.disconnected {
            return Err(AdapterError::Disconnected);
        }
        self.carry.clear();
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => return Err(self.set_disconnected()),
                Ok(_) => continue,
                Err(e) if is_timeout(&e) => return Ok(()),
                Err(_) => return Err(self.set_disconnected()),
            }
        }
    }

    /// Sends one command line and performs the echo handshake: the first
    /// received line must begin with the command. Up to [`ECHO_SPURIOUS_MAX`]
    /// non-matching lines are dropped as crossing traffic.
    fn write_line(&mut self, line: &str) -> Result<(), AdapterError> {
        if self.disconnected {
            return Err(AdapterError::Disconnected);
        }
        if self.send_raw(line).is_err() {
            return Err(self.set_disconnected());
        }

        let mut spurious = 0;
        loop {
            match self.read_line()? {
                Some(echo) if echo.starts_with(line) => return Ok(()),
                other => {
                    spurious += 1;
                    if spurious > ECHO_SPURIOUS_MAX {
                        log::warn!("wrong answer: got {:?} instead of {:?}", other, line);
                        self.set_disconnected();
                        return Err(AdapterError::Echo(line.to_owned()));
                    }
                }
            }
        }
    }

    /// Reads one complete line, waiting at most [`IDLE_TIMEOUT`] after the
    /// last received byte. Bytes past the first newline stay in the carry
    /// buffer for the next call.
    fn read_line(&mut self) -> Result<Option<String>, AdapterError> {
        if self.disconnected {
            return Err(AdapterError::Disconnected);
        }
        if let Some(line) = self.take_carried_line() {
            return Ok(Some(line));
        }

        let mut idle_since = Instant::now();
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => return Err(self.set_disconnected()),
                Ok(n) => {
                    self.carry.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_carried_line() {
                        return Ok(Some(line));
                    }
                    idle_since = Instant::now();
                }
                Err(e) if is_timeout(&e) => {
                    if idle_since.elapsed() >= IDLE_TIMEOUT {
                        return Ok(None);
                    }
                }
                Err(_) => return Err(self.set_disconnected()),
            }
        }
    }

    fn send_raw(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn take_carried_line(&mut self) -> Option<String> {
        let pos = self.carry.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.carry.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn set_disconnected(&mut self) -> AdapterError {
        log::warn!("TTY disconnected");
        self.disconnected = true;
        AdapterError::Disconnected
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
