//! Submission and completion queue entry layouts and command builders.
//!
//! All device-facing words are stored little-endian; builders and accessors
//! convert at the edge.

use crate::error::StatusCode;

/// High bit of the command identifier, reserved to mark Asynchronous Event
/// Requests so the completion path can recognize them regardless of which
/// tracker slot they occupy. Tracker cids live in the low 15 bits.
pub const CID_AER: u16 = 1 << 15;

const OPCODE_ADMIN_DELETE_SQ: u8 = 0x00;
const OPCODE_ADMIN_CREATE_SQ: u8 = 0x01;
const OPCODE_ADMIN_GET_LOG_PAGE: u8 = 0x02;
const OPCODE_ADMIN_DELETE_CQ: u8 = 0x04;
const OPCODE_ADMIN_CREATE_CQ: u8 = 0x05;
const OPCODE_ADMIN_IDENTIFY: u8 = 0x06;
const OPCODE_ADMIN_SET_FEATURES: u8 = 0x09;
const OPCODE_ADMIN_ASYNC_EVENT: u8 = 0x0C;
const OPCODE_ADMIN_DBBUF_CONFIG: u8 = 0x7C;

const OPCODE_IO_FLUSH: u8 = 0x00;
const OPCODE_IO_WRITE: u8 = 0x01;
const OPCODE_IO_READ: u8 = 0x02;

/// Queue flag: physically contiguous.
const QFLAG_PC: u32 = 1;

#[derive(Debug)]
pub enum QueueType {
    Submission,
    Completion,
}

#[derive(Debug)]
pub enum IdentifyType {
    Namespace(u32),
    Controller,
    NamespaceList(u32),
}

#[derive(Debug, Clone, Copy)]
pub enum FeatureId {
    NumberOfQueues = 0x07,
    AsyncEventConfig = 0x0B,
}

/// A 64-byte submission queue entry.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Command {
    opcode: u8,
    flags: u8,
    cid: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    mptr: u64,
    dptr: [u64; 2],
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn cid(&self) -> u16 {
        u16::from_le(self.cid)
    }

    /// Associate the entry with a command identifier. Called by the request
    /// tracker just before posting; the AER path sets the marker bit on top.
    pub fn set_cid(&mut self, cid: u16) {
        self.cid = cid.to_le();
    }

    /// Fill the data pointer with the two PRP entries.
    pub fn set_dptr(&mut self, prp1: u64, prp2: u64) {
        self.dptr = [prp1.to_le(), prp2.to_le()];
    }

    pub fn prp1(&self) -> u64 {
        u64::from_le(self.dptr[0])
    }

    pub fn prp2(&self) -> u64 {
        u64::from_le(self.dptr[1])
    }

    pub fn identify(target: IdentifyType) -> Self {
        let (nsid, cns): (u32, u32) = match target {
            IdentifyType::Namespace(id) => (id, 0),
            IdentifyType::Controller => (0, 1),
            IdentifyType::NamespaceList(base) => (base, 2),
        };

        Self {
            opcode: OPCODE_ADMIN_IDENTIFY,
            nsid: nsid.to_le(),
            cdw10: cns.to_le(),
            ..Default::default()
        }
    }

    pub fn set_features(fid: FeatureId, cdw11: u32) -> Self {
        Self {
            opcode: OPCODE_ADMIN_SET_FEATURES,
            cdw10: (fid as u32).to_le(),
            cdw11: cdw11.to_le(),
            ..Default::default()
        }
    }

    /// Create an I/O queue. `qsize` is the real size; the 0-based conversion
    /// happens here. Submission queues carry the bound completion queue id.
    pub fn create_queue(qid: u16, qsize: u16, iova: u64, target: QueueType, cqid: Option<u16>) -> Self {
        let (opcode, cdw11) = match target {
            QueueType::Submission => {
                let cqid = cqid.unwrap_or(qid);
                (OPCODE_ADMIN_CREATE_SQ, ((cqid as u32) << 16) | QFLAG_PC)
            }
            QueueType::Completion => (OPCODE_ADMIN_CREATE_CQ, QFLAG_PC),
        };

        Self {
            opcode,
            dptr: [iova.to_le(), 0],
            cdw10: ((((qsize - 1) as u32) << 16) | qid as u32).to_le(),
            cdw11: cdw11.to_le(),
            ..Default::default()
        }
    }

    pub fn delete_queue(qid: u16, target: QueueType) -> Self {
        let opcode = match target {
            QueueType::Submission => OPCODE_ADMIN_DELETE_SQ,
            QueueType::Completion => OPCODE_ADMIN_DELETE_CQ,
        };

        Self {
            opcode,
            cdw10: (qid as u32).to_le(),
            ..Default::default()
        }
    }

    pub fn async_event_request() -> Self {
        Self {
            opcode: OPCODE_ADMIN_ASYNC_EVENT,
            ..Default::default()
        }
    }

    /// Tell the controller where the shadow doorbell pages live.
    pub fn dbbuf_config(doorbells_iova: u64, eventidxs_iova: u64) -> Self {
        Self {
            opcode: OPCODE_ADMIN_DBBUF_CONFIG,
            dptr: [doorbells_iova.to_le(), eventidxs_iova.to_le()],
            ..Default::default()
        }
    }

    pub fn get_log_page(lid: u8, num_dwords: u32, offset: u64) -> Self {
        let numd = num_dwords - 1;

        Self {
            opcode: OPCODE_ADMIN_GET_LOG_PAGE,
            cdw10: ((lid as u32) | ((numd & 0xFFFF) << 16)).to_le(),
            cdw11: (numd >> 16).to_le(),
            cdw12: (offset as u32).to_le(),
            cdw13: ((offset >> 32) as u32).to_le(),
            ..Default::default()
        }
    }

    /// An I/O read or write; `nlb` is the 0-based block count. The data
    /// pointer is filled separately via the PRP mapping helpers.
    pub fn read_write(nsid: u32, slba: u64, nlb: u16, write: bool) -> Self {
        Self {
            opcode: if write { OPCODE_IO_WRITE } else { OPCODE_IO_READ },
            nsid: nsid.to_le(),
            cdw10: (slba as u32).to_le(),
            cdw11: ((slba >> 32) as u32).to_le(),
            cdw12: (nlb as u32).to_le(),
            ..Default::default()
        }
    }

    pub fn flush(nsid: u32) -> Self {
        Self {
            opcode: OPCODE_IO_FLUSH,
            nsid: nsid.to_le(),
            ..Default::default()
        }
    }
}

/// A 16-byte completion queue entry.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Completion {
    dw0: u32,
    dw1: u32,
    sq_head: u16,
    sq_id: u16,
    cid: u16,
    status: u16,
}

impl Completion {
    /// Command-specific result dword.
    pub fn dw0(&self) -> u32 {
        u32::from_le(self.dw0)
    }

    pub fn dw1(&self) -> u32 {
        u32::from_le(self.dw1)
    }

    /// Submission queue head pointer at completion time.
    pub fn sq_head(&self) -> u16 {
        u16::from_le(self.sq_head)
    }

    pub fn sq_id(&self) -> u16 {
        u16::from_le(self.sq_id)
    }

    pub fn cid(&self) -> u16 {
        u16::from_le(self.cid)
    }

    pub(crate) fn set_cid(&mut self, cid: u16) {
        self.cid = cid.to_le();
    }

    /// The raw status-phase field.
    pub fn status_raw(&self) -> u16 {
        u16::from_le(self.status)
    }

    /// The phase tag.
    pub fn phase(&self) -> bool {
        self.status_raw() & 0x1 != 0
    }

    /// The status field without the phase tag.
    pub fn status(&self) -> u16 {
        self.status_raw() >> 1
    }

    pub fn is_ok(&self) -> bool {
        self.status() == 0
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_raw(self.status_raw())
    }
}
