//! Expedited CANopen SDO encoding and decoding.
//!
//! Only the expedited form (at most 4 data bytes) is handled; segmented and
//! block transfers are out of scope for the bridged stepper controllers.

use embedded_can::StandardId;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dict::DictEntry;
use crate::frame::CanFrame;

/// COB-ID base of an SDO request (client to node)
pub const RSDO_COBID: u16 = 0x600;
/// COB-ID base of an SDO response (node to client)
pub const TSDO_COBID: u16 = 0x580;
/// Mask selecting the COB-ID base from a message identifier
pub const COBID_MASK: u16 = 0x780;
/// Mask selecting the node ID from a message identifier
pub const NODEID_MASK: u16 = 0x7F;

// e and s bits of the first SDO byte (expedited, size indicated)
const SDO_E: u8 = 1 << 1;
const SDO_S: u8 = 1 << 0;

/// Client command specifier of the first SDO byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Ccs {
    SegDownload = 0,
    InitDownload = 1,
    InitUpload = 2,
    SegUpload = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

/// An expedited SDO transfer, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdo {
    pub node_id: u8,
    pub ccs: Ccs,
    pub index: u16,
    pub subindex: u8,
    /// Up to 4 payload bytes, data[0] is least significant
    pub data: [u8; 4],
    pub datalen: u8,
}

/// The decoded payload of an SDO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoValue {
    /// Zero-length response: the write was acknowledged
    Acked,
    /// The node aborted the transfer with the given code
    Abort(u32),
    /// An expedited value, sign-extended per the dictionary entry
    Value(i64),
}

impl Sdo {
    /// Builds a request to read (initiate upload of) a dictionary entry.
    pub fn read_request(entry: &DictEntry, node_id: u8) -> Sdo {
        Sdo {
            node_id,
            ccs: Ccs::InitUpload,
            index: entry.index,
            subindex: entry.subindex,
            data: [0; 4],
            datalen: 0,
        }
    }

    /// Builds a request to write (initiate download of) `value` into a
    /// dictionary entry. The value is encoded little-endian in the entry's
    /// declared width; a width of 3 is never declared and folds to 2.
    pub fn write_request(entry: &DictEntry, node_id: u8, value: i64) -> Sdo {
        let size = match entry.datasize {
            1 => 1,
            4 => 4,
            _ => 2,
        };
        let mut data = [0u8; 4];
        data[..size].copy_from_slice(&(value as u32).to_le_bytes()[..size]);
        Sdo {
            node_id,
            ccs: Ccs::InitDownload,
            index: entry.index,
            subindex: entry.subindex,
            data,
            datalen: size as u8,
        }
    }

    /// Encodes the SDO as an outbound request frame (COB-ID `0x600 + node`).
    pub fn to_frame(&self) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = u8::from(self.ccs) << 5;
        if self.datalen > 0 {
            data[0] |= ((4 - self.datalen) << 2) | SDO_E | SDO_S;
            let len = usize::from(self.datalen);
            data[4..4 + len].copy_from_slice(&self.data[..len]);
        }
        data[1] = (self.index & 0xFF) as u8;
        data[2] = (self.index >> 8) as u8;
        data[3] = self.subindex;

        // node id is masked to 7 bits, so the id stays below 0x680
        let id = StandardId::new(RSDO_COBID | u16::from(self.node_id) & NODEID_MASK).unwrap();
        CanFrame::new(id, &data).unwrap()
    }

    /// Decodes a received frame as an SDO response. Returns `None` unless
    /// the frame carries all 8 bytes and its COB-ID base is TSDO.
    pub fn from_frame(frame: &CanFrame) -> Option<Sdo> {
        if frame.dlc() != 8 {
            return None;
        }
        let raw = frame.raw_id();
        if raw & COBID_MASK != TSDO_COBID {
            return None;
        }

        let bytes = frame.data();
        let specifier = bytes[0];
        let ccs = Ccs::try_from(specifier >> 5).ok()?;

        let datalen = if specifier & SDO_E != 0 && specifier & SDO_S != 0 {
            4 - ((specifier >> 2) & 0x3)
        } else if ccs == Ccs::Abort {
            // the payload is the abort code
            4
        } else {
            0
        };

        let mut data = [0u8; 4];
        data.copy_from_slice(&bytes[4..8]);

        Some(Sdo {
            node_id: (raw & NODEID_MASK) as u8,
            ccs,
            index: u16::from(bytes[1]) | u16::from(bytes[2]) << 8,
            subindex: bytes[3],
            data,
            datalen,
        })
    }

    /// Extracts the typed payload of a response, interpreting the raw bytes
    /// through a dictionary entry. A mismatch between the received length
    /// and the declared width is logged but the value is still decoded from
    /// the received length.
    pub fn value_of(&self, entry: &DictEntry) -> SdoValue {
        if self.ccs == Ccs::Abort {
            return SdoValue::Abort(u32::from_le_bytes(self.data));
        }
        if self.datalen == 0 {
            return SdoValue::Acked;
        }
        if self.datalen != entry.datasize {
            log::warn!(
                "SDO 0x{:04X}/{} answered {} bytes, dictionary declares {}",
                self.index,
                self.subindex,
                self.datalen,
                entry.datasize
            );
        }

        let value = match (entry.signed, self.datalen) {
            (true, 1) => i64::from(self.data[0] as i8),
            (true, 4) => i64::from(i32::from_le_bytes(self.data)),
            (true, _) => i64::from(i16::from_le_bytes([self.data[0], self.data[1]])),
            (false, 1) => i64::from(self.data[0]),
            (false, 4) => i64::from(u32::from_le_bytes(self.data)),
            (false, _) => i64::from(u16::from_le_bytes([self.data[0], self.data[1]])),
        };
        SdoValue::Value(value)
    }

    /// Renders the SDO in the diagnostic form used on the broadcast bus by
    /// the canopen worker.
    pub fn to_broadcast_line(&self) -> String {
        let mut line = format!(
            "nid=0x{:02X}, idx=0x{:04X}, subidx={}, ccs=0x{:02X}, datalen={}",
            self.node_id,
            self.index,
            self.subindex,
            u8::from(self.ccs),
            self.datalen
        );
        if self.datalen > 0 {
            line.push_str(", data=[");
            for (i, byte) in self.data[..usize::from(self.datalen)].iter().enumerate() {
                if i > 0 {
                    line.push_str(", ");
                }
                line.push_str(&format!("0x{:02X}", byte));
            }
            line.push(']');
        }
        line
    }
}

/// Standard CANopen abort codes, sorted by code for binary search.
static ABORT_CODES: [(u32, &str); 29] = [
    (0x05030000, "Toggle bit not alternated"),
    (0x05040000, "SDO protocol timed out"),
    (0x05040001, "Client/server command specifier not valid or unknown"),
    (0x05040002, "Invalid block size (block mode only)"),
    (0x05040003, "Invalid sequence number (block mode only)"),
    (0x05040004, "CRC error (block mode only)"),
    (0x05040005, "Out of memory"),
    (0x06010000, "Unsupported access to an object"),
    (0x06010001, "Attempt to read a write only object"),
    (0x06010002, "Attempt to write a read only object"),
    (0x06020000, "Object does not exist in the object dictionary"),
    (0x06040041, "Object cannot be mapped to the PDO"),
    (
        0x06040042,
        "The number and length of the objects to be mapped would exceed PDO length",
    ),
    (0x06040043, "General parameter incompatibility reason"),
    (0x06040047, "General internal incompatibility in the device"),
    (0x06060000, "Access failed due to a hardware error"),
    (
        0x06070010,
        "Data type does not match; length of service parameter does not match",
    ),
    (
        0x06070012,
        "Data type does not match; length of service parameter too high",
    ),
    (
        0x06070013,
        "Data type does not match; length of service parameter too low",
    ),
    (0x06090011, "Sub-index does not exist"),
    (
        0x06090030,
        "Value range of parameter exceeded (only for write access)",
    ),
    (0x06090031, "Value of parameter written too high"),
    (0x06090032, "Value of parameter written too low"),
    (0x06090036, "Maximum value is less than minimum value"),
    (0x08000000, "General error"),
    (
        0x08000020,
        "Data cannot be transferred or stored to the application",
    ),
    (
        0x08000021,
        "Data cannot be transferred or stored to the application because of local control",
    ),
    (
        0x08000022,
        "Data cannot be transferred or stored to the application because of the present device state",
    ),
    (
        0x08000023,
        "Object dictionary dynamic generation fails or no object dictionary is present",
    ),
];

/// Human-readable explanation of an abort code, or `None` for codes outside
/// the standard table.
pub fn abort_text(code: u32) -> Option<&'static str> {
    ABORT_CODES
        .binary_search_by_key(&code, |&(c, _)| c)
        .ok()
        .map(|i| ABORT_CODES[i].1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::dict;

    #[test]
    fn read_request_wire_format() {
        // reading object 0x6041/0 of node 1 must produce `s 1537 64 65 96 0 0 0 0 0`
        let entry = DictEntry {
            index: 0x6041,
            subindex: 0,
            datasize: 2,
            signed: false,
            name: "STATUSWORD",
        };
        let frame = Sdo::read_request(&entry, 1).to_frame();
        assert_eq!(
            Command::TransmitFrame(frame).as_line(),
            "s 1537 64 65 96 0 0 0 0 0"
        );
    }

    #[test]
    fn write_request_first_byte_encodes_length() {
        let sdo = Sdo::write_request(&dict::RELSTEPS, 1, 1200);
        let frame = sdo.to_frame();
        // ccs=1, n=0, e=1, s=1
        assert_eq!(frame.data()[0], (1 << 5) | SDO_E | SDO_S);
        assert_eq!(&frame.data()[4..8], &1200u32.to_le_bytes());

        let sdo = Sdo::write_request(&dict::STOP, 3, 1);
        let frame = sdo.to_frame();
        // ccs=1, n=3, e=1, s=1
        assert_eq!(frame.data()[0], (1 << 5) | (3 << 2) | SDO_E | SDO_S);
        assert_eq!(frame.raw_id(), 0x603);
    }

    fn as_response(frame: &CanFrame) -> CanFrame {
        // flip the COB-ID base from RSDO to TSDO, keeping node and payload
        let id = StandardId::new(TSDO_COBID | (frame.raw_id() & NODEID_MASK)).unwrap();
        CanFrame::new(id, frame.data()).unwrap()
    }

    #[test]
    fn write_decode_round_trip_over_dictionary() {
        for entry in dict::ENTRIES {
            for &value in &[0i64, 1, 17, -1, 127, -128] {
                if !entry.signed && value < 0 {
                    continue;
                }
                let request = Sdo::write_request(entry, 0x20, value);
                let decoded = Sdo::from_frame(&as_response(&request.to_frame())).unwrap();
                assert_eq!(decoded.index, entry.index);
                assert_eq!(decoded.subindex, entry.subindex);
                assert_eq!(decoded.node_id, 0x20);
                assert_eq!(decoded.datalen, request.datalen);
                assert_eq!(decoded.value_of(entry), SdoValue::Value(value));
            }
        }
    }

    #[test]
    fn decode_rejects_non_tsdo_frames() {
        let rsdo = Sdo::read_request(&dict::POSITION, 1).to_frame();
        assert!(Sdo::from_frame(&rsdo).is_none());

        let short = CanFrame::new(StandardId::new(0x581).unwrap(), &[0x43, 0, 0]).unwrap();
        assert!(Sdo::from_frame(&short).is_none());
    }

    #[test]
    fn decode_abort_carries_code() {
        let frame = CanFrame::new(
            StandardId::new(0x581).unwrap(),
            &[0x80, 0x00, 0x60, 0x00, 0x00, 0x00, 0x04, 0x06],
        )
        .unwrap();
        let sdo = Sdo::from_frame(&frame).unwrap();
        assert_eq!(sdo.ccs, Ccs::Abort);
        assert_eq!(sdo.datalen, 4);
        assert_eq!(
            sdo.value_of(&dict::ERRSTATE),
            SdoValue::Abort(0x06040000)
        );
    }

    #[test]
    fn zero_length_response_is_an_ack() {
        let frame = CanFrame::new(
            StandardId::new(0x581).unwrap(),
            &[0x60, 0x04, 0x60, 0x00, 0x00, 0x00, 0x00, 0x00],
        )
        .unwrap();
        let sdo = Sdo::from_frame(&frame).unwrap();
        assert_eq!(sdo.value_of(&dict::RELSTEPS), SdoValue::Acked);
    }

    #[test]
    fn abort_search_finds_every_code() {
        for &(code, text) in &ABORT_CODES {
            assert_eq!(abort_text(code), Some(text));
        }
        assert_eq!(abort_text(0x00000000), None);
        assert_eq!(abort_text(0x06040044), None);
        assert_eq!(abort_text(0xFFFFFFFF), None);
    }

    #[test]
    fn broadcast_line_matches_diagnostic_form() {
        let frame = CanFrame::new(
            StandardId::new(0x581).unwrap(),
            &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x02, 0x00, 0x00],
        )
        .unwrap();
        let sdo = Sdo::from_frame(&frame).unwrap();
        assert_eq!(
            sdo.to_broadcast_line(),
            "nid=0x01, idx=0x6041, subidx=0, ccs=0x02, datalen=2, data=[0x37, 0x02]"
        );
    }
}
