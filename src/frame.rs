use embedded_can::StandardId;

/// Represents a single classic CAN 2.0 data frame as it travels between the
/// adapter, the dispatch engine and the per-node workers.
///
/// The adapter stamps every received frame with its own milliseconds-since-
/// boot counter; frames built locally for transmission carry a timestamp of
/// zero (the adapter ignores it on the way out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: StandardId,
    data: heapless::Vec<u8, 8>,
    timestamp: u32,
}

impl CanFrame {
    /// Creates a new data frame. `data` must have a length in the range
    /// 0..=8 or else `None` will be returned instead.
    pub fn new(id: impl Into<StandardId>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        Some(Self {
            id: id.into(),
            data: heapless::Vec::from_slice(data).unwrap(),
            timestamp: 0,
        })
    }

    /// Creates a frame carrying the adapter-supplied receive timestamp.
    pub fn with_timestamp(id: impl Into<StandardId>, data: &[u8], timestamp: u32) -> Option<Self> {
        let mut frame = Self::new(id, data)?;
        frame.timestamp = timestamp;
        Some(frame)
    }

    /// Gets the message ID of the frame
    pub fn id(&self) -> StandardId {
        self.id
    }

    /// Gets the raw 11-bit value of the message ID
    pub fn raw_id(&self) -> u16 {
        self.id.as_raw()
    }

    /// Gets the data associated with the frame (length is the DLC)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Gets the DLC (Data Length Code) of the frame
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Gets the adapter receive timestamp (ms since adapter boot, 0 for
    /// locally built frames)
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Renders the frame in the `#0x<ID> 0x<b0> …` notation used on the
    /// broadcast bus when a raw worker reports a received frame.
    pub fn to_broadcast_line(&self) -> String {
        let mut line = format!("#0x{:03X}", self.raw_id());
        for byte in self.data() {
            line.push_str(&format!(" 0x{:02X}", byte));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u16) -> StandardId {
        StandardId::new(raw).unwrap()
    }

    #[test]
    fn rejects_oversized_data() {
        assert!(CanFrame::new(sid(0x123), &[0u8; 9]).is_none());
        assert!(CanFrame::new(sid(0x123), &[0u8; 8]).is_some());
    }

    #[test]
    fn broadcast_line_format() {
        let frame = CanFrame::new(sid(0x123), &[0x11, 0x22, 0x33]).unwrap();
        assert_eq!(frame.to_broadcast_line(), "#0x123 0x11 0x22 0x33");

        let empty = CanFrame::new(sid(0x7), &[]).unwrap();
        assert_eq!(empty.to_broadcast_line(), "#0x007");
    }
}
