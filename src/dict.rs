//! Object dictionary of the stepper controller.
//!
//! Entries are declared once and materialize both as named constants (for
//! the worker logic) and as the [`ENTRIES`] table (for lookup by index and
//! subindex).

/// A CANopen object-dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictEntry {
    pub index: u16,
    pub subindex: u8,
    /// On-the-wire size in bytes: 1, 2 or 4
    pub datasize: u8,
    pub signed: bool,
    pub name: &'static str,
}

macro_rules! dictionary {
    ($($(#[$meta:meta])* $name:ident = ($idx:expr, $sub:expr, $size:expr, $signed:expr);)+) => {
        $($(#[$meta])*
        pub const $name: DictEntry = DictEntry {
            index: $idx,
            subindex: $sub,
            datasize: $size,
            signed: $signed,
            name: stringify!($name),
        };)+

        /// All known dictionary entries, in declaration order.
        pub static ENTRIES: &[&DictEntry] = &[$(&$name),+];
    };
}

dictionary! {
    /// heartbeat time
    HEARTBTTIME = (0x1017, 0, 2, false);
    /// node ID
    NODEID = (0x2002, 0, 1, false);
    /// CAN baudrate code
    BAUDRATE = (0x2003, 0, 1, false);
    /// system control: 1 - bootloader, 2 - save parameters, 3 - factory reset
    SYSCONTROL = (0x2007, 0, 1, false);
    /// error state
    ERRSTATE = (0x6000, 0, 1, false);
    /// controller status
    DEVSTATUS = (0x6001, 0, 1, false);
    /// rotation direction
    ROTDIR = (0x6002, 0, 1, false);
    /// maximal speed
    MAXSPEED = (0x6003, 0, 4, true);
    /// relative displacement
    RELSTEPS = (0x6004, 0, 4, false);
    /// operation mode
    OPMODE = (0x6005, 0, 1, false);
    /// start speed
    STARTSPEED = (0x6006, 0, 2, false);
    /// stop speed
    STOPSPEED = (0x6007, 0, 2, false);
    /// acceleration coefficient
    ACCELCOEF = (0x6008, 0, 1, false);
    /// deceleration coefficient
    DECELCOEF = (0x6009, 0, 1, false);
    /// microstepping
    MICROSTEPS = (0x600A, 0, 2, false);
    /// max current
    MAXCURNT = (0x600B, 0, 2, false);
    /// current position
    POSITION = (0x600C, 0, 4, false);
    /// motor enable
    ENABLE = (0x600E, 0, 1, false);
    /// external emergency stop enable
    EXTENABLE = (0x600F, 1, 1, false);
    /// external emergency stop trigger mode
    EXTTRIGMODE = (0x600F, 2, 1, false);
    /// external emergency sensor type
    EXTSENSTYPE = (0x600F, 3, 1, false);
    /// absolute displacement
    ABSSTEPS = (0x601C, 0, 4, true);
    /// stop motor
    STOP = (0x6020, 0, 1, false);
}

/// Looks up an entry by (index, subindex). The scan is linear as the
/// dictionary can be unsorted.
pub fn find(index: u16, subindex: u8) -> Option<&'static DictEntry> {
    ENTRIES
        .iter()
        .copied()
        .find(|e| e.index == index && e.subindex == subindex)
}

// controller status bits
static DEV_STATUS_BITS: [&str; 8] = [
    "External stop 1",
    "External stop 2",
    "Stall state",
    "Busy state",
    "External stop 3",
    "The FIFO of PVT Mode 3 is empty",
    "FIFO Lower bound of PVT Mode 3",
    "FIFO upper limit of PVT mode 3",
];

// controller error bits
static DEV_ERROR_BITS: [&str; 6] = [
    "TSD, over temperature shutdown",
    "AERR, coil A error",
    "BERR, coil B error",
    "AOC, A over current",
    "BOC, B over current",
    "UVLO, low voltage fault",
];

/// Name of a set bit in a DEVSTATUS value, or `None` when the bit is clear
/// or out of range.
pub fn status_bit_name(status: u8, bit: u8) -> Option<&'static str> {
    if bit > 7 || status & (1 << bit) == 0 {
        return None;
    }
    Some(DEV_STATUS_BITS[bit as usize])
}

/// Name of a set bit in an ERRSTATE value, or `None` when the bit is clear
/// or out of range.
pub fn error_bit_name(error: u8, bit: u8) -> Option<&'static str> {
    if bit > 5 || error & (1 << bit) == 0 {
        return None;
    }
    Some(DEV_ERROR_BITS[bit as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_index_and_subindex() {
        assert_eq!(find(0x6004, 0), Some(&RELSTEPS));
        assert_eq!(find(0x600F, 2), Some(&EXTTRIGMODE));
        assert_eq!(find(0x600F, 9), None);
        assert_eq!(find(0x6041, 0), None);
    }

    #[test]
    fn every_constant_is_reachable_through_the_table() {
        for entry in ENTRIES {
            assert_eq!(find(entry.index, entry.subindex), Some(*entry));
        }
    }

    #[test]
    fn signedness_matches_controller_manual() {
        assert!(MAXSPEED.signed);
        assert!(ABSSTEPS.signed);
        assert!(!RELSTEPS.signed);
        assert!(!POSITION.signed);
    }

    #[test]
    fn status_bits() {
        assert_eq!(status_bit_name(0b1000, 3), Some("Busy state"));
        assert_eq!(status_bit_name(0b1000, 2), None);
        assert_eq!(status_bit_name(0xFF, 8), None);
        assert_eq!(error_bit_name(0b10_0000, 5), Some("UVLO, low voltage fault"));
        assert_eq!(error_bit_name(0xFF, 6), None);
    }
}
