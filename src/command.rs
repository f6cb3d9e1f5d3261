use crate::frame::CanFrame;

/// A command sent to the CAN adapter along with its attached data.
///
/// The adapter speaks a line-per-command ASCII protocol and echoes every
/// command back verbatim before any other output, which
/// [`Adapter`](crate::adapter::Adapter) uses as a write handshake.
#[derive(Debug, Clone)]
pub enum Command {
    /// `b <kbaud>` - reinitialize the CAN bus at the given bitrate
    SetBitRate(u32),
    /// `s <id> <b0> … <bN>` - transmit a frame on the bus
    TransmitFrame(CanFrame),
}

impl Command {
    /// Serializes the command into the adapter's line syntax (without the
    /// trailing newline). Numeric tokens are always rendered in decimal;
    /// the adapter itself accepts decimal, hex or octal.
    pub fn as_line(&self) -> String {
        match self {
            Command::SetBitRate(kbaud) => format!("b {}", kbaud),
            Command::TransmitFrame(frame) => {
                let mut line = format!("s {}", frame.raw_id());
                for byte in frame.data() {
                    line.push_str(&format!(" {}", byte));
                }
                line
            }
        }
    }
}
