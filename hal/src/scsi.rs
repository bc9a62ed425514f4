//! # SCSI Command Helpers
//!
//! CDB builders for the handful of commands the responsiveness prober
//! issues, sense-data decoding and REPORT LUNS / INQUIRY payload parsing.

use crate::Lun;
use alloc::string::String;
use alloc::vec::Vec;

// =============================================================================
// OPERATION CODES
// =============================================================================

/// SCSI operation codes
pub mod opcode {
    /// Test Unit Ready
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// Inquiry
    pub const INQUIRY: u8 = 0x12;
    /// Start Stop Unit
    pub const START_STOP_UNIT: u8 = 0x1B;
    /// Report Luns
    pub const REPORT_LUNS: u8 = 0xA0;
}

/// Sense keys
pub mod sense_key {
    /// No sense
    pub const NO_SENSE: u8 = 0x0;
    /// Recovered error
    pub const RECOVERED_ERROR: u8 = 0x1;
    /// Not ready
    pub const NOT_READY: u8 = 0x2;
    /// Medium error
    pub const MEDIUM_ERROR: u8 = 0x3;
    /// Hardware error
    pub const HARDWARE_ERROR: u8 = 0x4;
    /// Illegal request
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    /// Unit attention
    pub const UNIT_ATTENTION: u8 = 0x6;
    /// Aborted command
    pub const ABORTED_COMMAND: u8 = 0xB;
}

/// Additional sense codes the prober distinguishes
pub mod asc {
    /// Logical unit not ready (qualified by ASCQ)
    pub const LUN_NOT_READY: u8 = 0x04;
    /// Defect list error
    pub const DEFECT_LIST_ERROR: u8 = 0x19;
    /// Defect list not found
    pub const DEFECT_LIST_NOT_FOUND: u8 = 0x1C;
    /// Logical unit not supported
    pub const LUN_NOT_SUPPORTED: u8 = 0x25;
    /// Power on, reset or bus device reset occurred
    pub const POWER_ON_RESET: u8 = 0x29;
    /// Medium not present
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    /// Low power condition on
    pub const LOW_POWER_CONDITION_ON: u8 = 0x5E;
}

/// ASCQ qualifiers for [`asc::LUN_NOT_READY`]
pub mod ascq {
    /// Cause not reportable
    pub const CAUSE_NOT_REPORTABLE: u8 = 0x00;
    /// In process of becoming ready
    pub const BECOMING_READY: u8 = 0x01;
    /// Initializing command required
    pub const INITIALIZING_COMMAND_REQUIRED: u8 = 0x02;
    /// Manual intervention required
    pub const MANUAL_INTERVENTION_REQUIRED: u8 = 0x03;
    /// Format in progress
    pub const FORMAT_IN_PROGRESS: u8 = 0x04;
    /// Notify (enable spinup) required
    pub const NOTIFY_REQUIRED: u8 = 0x11;
}

/// SCSI status byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiStatus {
    /// Command completed successfully
    Good = 0x00,
    /// Check Condition status
    CheckCondition = 0x02,
    /// Target is busy
    Busy = 0x08,
    /// Reservation Conflict
    ReservationConflict = 0x18,
    /// Task Set Full
    TaskSetFull = 0x28,
    /// ACA Active
    AcaActive = 0x30,
    /// Task Aborted
    TaskAborted = 0x40,
}

// =============================================================================
// CDB
// =============================================================================

/// Maximum CDB length handled here
pub const MAX_CDB_LENGTH: usize = 16;

/// SCSI Command Descriptor Block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LENGTH],
    len: usize,
}

impl Cdb {
    /// Build a CDB from raw bytes (truncated to 16)
    pub fn from_bytes(raw: &[u8]) -> Self {
        let len = raw.len().min(MAX_CDB_LENGTH);
        let mut bytes = [0u8; MAX_CDB_LENGTH];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes, len }
    }

    fn zeroed(len: usize) -> Self {
        Self { bytes: [0; MAX_CDB_LENGTH], len }
    }

    /// TEST UNIT READY
    pub fn test_unit_ready() -> Self {
        let mut cdb = Self::zeroed(6);
        cdb.bytes[0] = opcode::TEST_UNIT_READY;
        cdb
    }

    /// START STOP UNIT with the START bit set or cleared
    pub fn start_stop_unit(start: bool) -> Self {
        let mut cdb = Self::zeroed(6);
        cdb.bytes[0] = opcode::START_STOP_UNIT;
        cdb.bytes[4] = start as u8;
        cdb
    }

    /// REPORT LUNS with the given allocation length
    pub fn report_luns(alloc_len: u32) -> Self {
        let mut cdb = Self::zeroed(12);
        cdb.bytes[0] = opcode::REPORT_LUNS;
        cdb.bytes[6..10].copy_from_slice(&alloc_len.to_be_bytes());
        cdb
    }

    /// Standard INQUIRY
    pub fn inquiry(alloc_len: u16) -> Self {
        let mut cdb = Self::zeroed(6);
        cdb.bytes[0] = opcode::INQUIRY;
        cdb.bytes[3..5].copy_from_slice(&alloc_len.to_be_bytes());
        cdb
    }

    /// INQUIRY for a vital product data page
    pub fn inquiry_vpd(page: u8, alloc_len: u16) -> Self {
        let mut cdb = Self::inquiry(alloc_len);
        cdb.bytes[1] = 0x01;
        cdb.bytes[2] = page;
        cdb
    }

    /// Operation code
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Whether this is a START STOP UNIT asking the unit to start
    pub fn is_start_unit(&self) -> bool {
        self.opcode() == opcode::START_STOP_UNIT && self.bytes[4] & 0x01 != 0
    }

    /// Whether this is a START STOP UNIT asking the unit to stop
    pub fn is_stop_unit(&self) -> bool {
        self.opcode() == opcode::START_STOP_UNIT && self.bytes[4] & 0x01 == 0
    }
}

// =============================================================================
// SENSE DATA
// =============================================================================

/// Decoded sense triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Sense key
    pub key: u8,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl SenseData {
    /// Create from its parts
    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Decode fixed (0x70/0x71) or descriptor (0x72/0x73) format sense
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let response_code = raw.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 => {
                if raw.len() < 14 {
                    return None;
                }
                Some(Self::new(raw[2] & 0x0F, raw[12], raw[13]))
            }
            0x72 | 0x73 => {
                if raw.len() < 4 {
                    return None;
                }
                Some(Self::new(raw[1] & 0x0F, raw[2], raw[3]))
            }
            _ => None,
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Decode a REPORT LUNS payload into flat LUN numbers
///
/// Only peripheral (0b00) and flat (0b01) addressing are decoded; other
/// entries are skipped.
pub fn parse_report_luns(data: &[u8]) -> Vec<Lun> {
    if data.len() < 8 {
        return Vec::new();
    }
    let list_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let entries = &data[8..data.len().min(8 + list_len)];

    entries
        .chunks_exact(8)
        .filter_map(|entry| match entry[0] >> 6 {
            0b00 | 0b01 => Some((((entry[0] & 0x3F) as u64) << 8) | entry[1] as u64),
            _ => None,
        })
        .collect()
}

/// Encode LUNs into a REPORT LUNS payload (flat addressing above 255)
pub fn encode_report_luns(luns: &[Lun]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + luns.len() * 8);
    data.extend_from_slice(&((luns.len() * 8) as u32).to_be_bytes());
    data.extend_from_slice(&[0; 4]);
    for &lun in luns {
        let mut entry = [0u8; 8];
        if lun < 256 {
            entry[1] = lun as u8;
        } else {
            entry[0] = 0x40 | ((lun >> 8) as u8 & 0x3F);
            entry[1] = lun as u8;
        }
        data.extend_from_slice(&entry);
    }
    data
}

/// Vendor identification from standard INQUIRY data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InquiryIdentity {
    /// Peripheral device type
    pub device_type: u8,
    /// T10 vendor id
    pub vendor: String,
    /// Product id
    pub product: String,
    /// Product revision
    pub revision: String,
}

impl InquiryIdentity {
    /// Parse the first 36 bytes of standard INQUIRY data
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 36 {
            return None;
        }
        let field = |range: core::ops::Range<usize>| {
            String::from(core::str::from_utf8(&data[range]).unwrap_or("").trim())
        };
        Some(Self {
            device_type: data[0] & 0x1F,
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_cdb_builders() {
        assert_eq!(Cdb::test_unit_ready().as_bytes(), &[0u8; 6]);
        assert!(Cdb::start_stop_unit(true).is_start_unit());
        assert!(Cdb::start_stop_unit(false).is_stop_unit());
        let rl = Cdb::report_luns(0x1000);
        assert_eq!(rl.as_bytes().len(), 12);
        assert_eq!(&rl.as_bytes()[6..10], &[0, 0, 0x10, 0]);
    }

    #[test]
    fn test_sense_fixed_and_descriptor() {
        let mut fixed = [0u8; 18];
        fixed[0] = 0x70;
        fixed[2] = sense_key::NOT_READY;
        fixed[12] = asc::LUN_NOT_READY;
        fixed[13] = ascq::INITIALIZING_COMMAND_REQUIRED;
        assert_eq!(
            SenseData::parse(&fixed),
            Some(SenseData::new(0x2, 0x04, 0x02))
        );

        let desc = [0x72, sense_key::UNIT_ATTENTION, asc::POWER_ON_RESET, 0x00];
        assert_eq!(SenseData::parse(&desc), Some(SenseData::new(0x6, 0x29, 0)));
        assert_eq!(SenseData::parse(&[0x70, 0, 0]), None);
    }

    #[test]
    fn test_report_luns_decode() {
        let data = encode_report_luns(&[0, 1, 300]);
        assert_eq!(parse_report_luns(&data), vec![0, 1, 300]);
        assert!(parse_report_luns(&[0; 4]).is_empty());
    }

    #[test]
    fn test_inquiry_identity() {
        let mut data = vec![0u8; 36];
        data[8..16].copy_from_slice(b"ATA     ");
        data[16..32].copy_from_slice(b"ST4000NM0033    ");
        data[32..36].copy_from_slice(b"GA0A");
        let id = InquiryIdentity::parse(&data).unwrap();
        assert_eq!(id.vendor, "ATA");
        assert_eq!(id.product, "ST4000NM0033");
        assert_eq!(id.revision, "GA0A");
    }
}
