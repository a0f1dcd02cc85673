//! NVMe admin command and completion structures
//!
//! The submission and completion entry layouts are parsed directly by the
//! device, so both are byte-exact: a 64-byte submission entry and a
//! 16-byte completion entry, with sub-fields packed by explicit shifts
//! and masks rather than structure layout tricks.

use crate::controller::NvmeError;

/// Admin command opcodes supported by this driver
pub mod opcodes {
    pub const IDENTIFY: u8 = 0x06;
    pub const ABORT: u8 = 0x08;
}

/// IDENTIFY command CNS (Controller or Namespace Structure) values
pub mod identify_cns {
    pub const NAMESPACE: u8 = 0x00; // Identify Namespace
    pub const CONTROLLER: u8 = 0x01; // Identify Controller
}

/// Size of one Identify data page. The data pointer of an Identify
/// command must reference a buffer of at least this size.
pub const IDENTIFY_DATA_SIZE: usize = 4096;

// CDW0 sub-field positions
const CDW0_OPCODE_SHIFT: u32 = 0;
const CDW0_FUSE_SHIFT: u32 = 8;
const CDW0_PSDT_SHIFT: u32 = 14;
const CDW0_CID_SHIFT: u32 = 16;

const FUSE_NORMAL: u32 = 0b00; // not part of a fused pair
const PSDT_PRP: u32 = 0b00; // data pointers are PRP entries

// Completion status field sub-field positions (bit 0 is the phase tag)
const STATUS_PHASE: u16 = 1 << 0;
const STATUS_SC_SHIFT: u16 = 1;
const STATUS_SC_MASK: u16 = 0xFF;
const STATUS_SCT_SHIFT: u16 = 9;
const STATUS_SCT_MASK: u16 = 0x7;
const STATUS_MORE: u16 = 1 << 14;
const STATUS_DNR: u16 = 1 << 15;

/// The admin command set supported here. Anything else is rejected at
/// construction time; extending the set is out of scope for this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    Identify = opcodes::IDENTIFY,
    Abort = opcodes::ABORT,
}

impl AdminOpcode {
    /// Validate a raw opcode against the supported command set.
    pub fn from_raw(opcode: u8) -> Result<Self, NvmeError> {
        match opcode {
            opcodes::IDENTIFY => Ok(Self::Identify),
            opcodes::ABORT => Ok(Self::Abort),
            other => Err(NvmeError::UnsupportedCommand(other)),
        }
    }
}

/// NVMe Submission Queue Entry (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeCommand {
    pub cdw0: u32,  // Opcode, FUSE, PSDT, CID
    pub nsid: u32,  // Namespace Identifier
    pub cdw2: u32,  // Reserved
    pub cdw3: u32,  // Reserved
    pub mptr: u64,  // Metadata Pointer
    pub prp1: u64,  // PRP Entry 1 (Physical Region Page)
    pub prp2: u64,  // PRP Entry 2
    pub cdw10: u32, // Command Dword 10
    pub cdw11: u32, // Command Dword 11
    pub cdw12: u32, // Command Dword 12
    pub cdw13: u32, // Command Dword 13
    pub cdw14: u32, // Command Dword 14
    pub cdw15: u32, // Command Dword 15
}

const _: () = assert!(core::mem::size_of::<NvmeCommand>() == 64);

impl NvmeCommand {
    /// Create a new command with all fields zeroed
    pub const fn new() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    /// Fill CDW0 for an admin command bound to a submission slot. The CID
    /// is the slot index, which keeps CIDs unique among outstanding
    /// commands. Per-opcode rules: Identify commands are never fused and
    /// carry PRP data pointers; Abort needs nothing beyond the header.
    pub fn admin(slot: u16, opcode: AdminOpcode) -> Self {
        let mut cmd = Self::new();
        let mut cdw0 = ((opcode as u8 as u32) << CDW0_OPCODE_SHIFT)
            | ((slot as u32) << CDW0_CID_SHIFT);
        match opcode {
            AdminOpcode::Identify => {
                cdw0 |= FUSE_NORMAL << CDW0_FUSE_SHIFT;
                cdw0 |= PSDT_PRP << CDW0_PSDT_SHIFT;
            }
            AdminOpcode::Abort => {}
        }
        cmd.cdw0 = cdw0;
        cmd
    }

    /// Create an IDENTIFY command. `buffer_addr` must be the physical
    /// address of a buffer of at least [`IDENTIFY_DATA_SIZE`] bytes.
    pub fn identify(slot: u16, cns: u8, cntid: u16, nsid: u32, buffer_addr: u64) -> Self {
        let mut cmd = Self::admin(slot, AdminOpcode::Identify);
        cmd.nsid = nsid;
        cmd.prp1 = buffer_addr;
        cmd.cdw10 = ((cntid as u32) << 16) | cns as u32;
        cmd
    }

    /// Create an ABORT command for a previously submitted command,
    /// addressed by its submission queue id and CID.
    pub fn abort(slot: u16, sqid: u16, cid: u16) -> Self {
        let mut cmd = Self::admin(slot, AdminOpcode::Abort);
        cmd.cdw10 = ((cid as u32) << 16) | sqid as u32;
        cmd
    }

    /// Get the opcode from CDW0 (bits 0-7)
    pub fn opcode(&self) -> u8 {
        (self.cdw0 >> CDW0_OPCODE_SHIFT) as u8
    }

    /// Get the fused-operation mode from CDW0 (bits 8-9)
    pub fn fuse(&self) -> u8 {
        ((self.cdw0 >> CDW0_FUSE_SHIFT) & 0b11) as u8
    }

    /// Get the PRP/SGL selector from CDW0 (bits 14-15)
    pub fn psdt(&self) -> u8 {
        ((self.cdw0 >> CDW0_PSDT_SHIFT) & 0b11) as u8
    }

    /// Get the command identifier from CDW0 (bits 16-31)
    pub fn command_id(&self) -> u16 {
        (self.cdw0 >> CDW0_CID_SHIFT) as u16
    }
}

/// NVMe Completion Queue Entry (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeCompletion {
    pub dw0: u32,     // Command Specific
    pub dw1: u32,     // Reserved
    pub sq_head: u16, // Submission Queue Head Pointer
    pub sq_id: u16,   // Submission Queue Identifier
    pub cid: u16,     // Command Identifier
    pub status: u16,  // Status Field (phase tag + SC + SCT + M + DNR)
}

const _: () = assert!(core::mem::size_of::<NvmeCompletion>() == 16);

impl NvmeCompletion {
    /// Get the phase tag (bit 0 of the status field)
    pub fn phase_bit(&self) -> bool {
        (self.status & STATUS_PHASE) != 0
    }

    /// Get the status code (bits 1-8)
    pub fn status_code(&self) -> u8 {
        ((self.status >> STATUS_SC_SHIFT) & STATUS_SC_MASK) as u8
    }

    /// Get the status code type (bits 9-11)
    pub fn status_code_type(&self) -> u8 {
        ((self.status >> STATUS_SCT_SHIFT) & STATUS_SCT_MASK) as u8
    }

    /// More-information flag: further status is in the error log
    pub fn more(&self) -> bool {
        (self.status & STATUS_MORE) != 0
    }

    /// Do-not-retry flag: resubmitting the command will not help
    pub fn do_not_retry(&self) -> bool {
        (self.status & STATUS_DNR) != 0
    }

    /// The status field without the phase tag, as carried in errors
    pub fn status_field(&self) -> u16 {
        self.status >> 1
    }

    /// Check if the command completed successfully
    pub fn is_success(&self) -> bool {
        self.status_code() == 0 && self.status_code_type() == 0
    }

    /// Check if this completion entry is new (has the expected phase tag)
    pub fn is_valid(&self, expected_phase: bool) -> bool {
        self.phase_bit() == expected_phase
    }
}

/// Controller Identify Data Structure (4096 bytes)
///
/// A passive view over the data page an IDENTIFY (CNS=1) command fills.
/// Only the fields this driver reads are named; reserved runs keep every
/// named field at its specified byte offset.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyController {
    pub vid: u16,      // PCI Vendor ID
    pub ssvid: u16,    // PCI Subsystem Vendor ID
    pub sn: [u8; 20],  // Serial Number
    pub mn: [u8; 40],  // Model Number
    pub fr: [u8; 8],   // Firmware Revision
    pub rab: u8,       // Recommended Arbitration Burst
    pub ieee: [u8; 3], // IEEE OUI Identifier
    pub cmic: u8,      // Controller Multi-Path I/O and Namespace Sharing
    pub mdts: u8,      // Maximum Data Transfer Size
    pub cntlid: u16,   // Controller ID
    pub ver: u32,      // Version
    pub _reserved1: [u8; 172],
    pub oacs: u16, // Optional Admin Command Support
    pub acl: u8,   // Abort Command Limit
    pub aerl: u8,  // Asynchronous Event Request Limit
    pub frmw: u8,  // Firmware Updates
    pub lpa: u8,   // Log Page Attributes
    pub elpe: u8,  // Error Log Page Entries
    pub npss: u8,  // Number of Power States Support
    pub _reserved2: [u8; 248],
    pub sqes: u8,   // Submission Queue Entry Size
    pub cqes: u8,   // Completion Queue Entry Size
    pub maxcmd: u16, // Maximum Outstanding Commands
    pub nn: u32,    // Number of Namespaces
    pub oncs: u16,  // Optional NVM Command Support
    pub fuses: u16, // Fused Operation Support
    pub _reserved3: [u8; 3572],
}

const _: () = assert!(core::mem::size_of::<IdentifyController>() == 4096);

impl IdentifyController {
    /// Serial number as a trimmed string
    pub fn serial(&self) -> &str {
        trim_ascii(&self.sn)
    }

    /// Model number as a trimmed string
    pub fn model(&self) -> &str {
        trim_ascii(&self.mn)
    }

    /// Firmware revision as a trimmed string
    pub fn firmware(&self) -> &str {
        trim_ascii(&self.fr)
    }
}

// Identify string fields are space-padded ASCII; NUL shows up in
// practice on some devices.
fn trim_ascii(field: &[u8]) -> &str {
    core::str::from_utf8(field)
        .unwrap_or("Unknown")
        .trim_end_matches('\0')
        .trim()
}
