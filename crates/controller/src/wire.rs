//! Packed little-endian frames exchanged on the attribute endpoints.
//!
//! Parsers check the exact length first and then read fixed offsets, so a
//! malformed frame is rejected before any state changes.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::error::{PackResult, StoreError};
use crate::pack::record::{
    FixedStr, PackRecord, PackSummary, PlantListEntry, PlantRecord, BUILTIN_PACK_ID,
    PLANT_RECORD_SIZE,
};
use crate::pack::streamer::ListFilter;
use crate::pack::store::StoreStats;
use crate::pack::transfer::{StartRequest, TransferState, TransferStatus};

pub const STREAM_NORMAL: u8 = 0x00;
pub const STREAM_COMPLETE: u8 = 0x01;
pub const STREAM_ERROR: u8 = 0x02;
pub const STREAM_STARTING: u8 = 0x80;

pub const LIST_HEADER_SIZE: usize = 4;
pub const LIST_ENTRY_SIZE: usize = 22;
pub const OP_RESULT_SIZE: usize = 8;
pub const STATS_SIZE: usize = 26;

pub const PACK_REQUEST_SIZE: usize = 4;
pub const PACK_LIST_ENTRY_SIZE: usize = 30;
pub const MAX_PACK_LIST_ENTRIES: usize = 4;
pub const MAX_PACK_CONTENT_IDS: usize = 16;
/// Display name of pack 0 in pack listings.
pub const BUILTIN_PACK_WIRE_NAME: &str = "Built-in Plants";

pub const TRANSFER_START_SIZE: usize = 47;
pub const TRANSFER_DATA_HEADER_SIZE: usize = 7;
pub const TRANSFER_STATUS_SIZE: usize = 16;

pub const HISTORY_REQUEST_SIZE: usize = 20;
pub const HISTORY_HEADER_SIZE: usize = 8;
pub const HISTORY_MAX_DATA: usize = 232;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("{what}: expected {expected} bytes, got {got}")]
    Length {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("bad record: {0}")]
    Record(#[from] StoreError),
}

impl WireError {
    pub fn result_code(&self) -> PackResult {
        match self {
            Self::Record(e) => e.result_code(),
            _ => PackResult::InvalidData,
        }
    }
}

fn expect_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<(), WireError> {
    if bytes.len() != expected {
        return Err(WireError::Length {
            what,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn expect_min(what: &'static str, bytes: &[u8], min: usize) -> Result<(), WireError> {
    if bytes.len() < min {
        return Err(WireError::Length {
            what,
            expected: min,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn fixed<const N: usize>(bytes: &[u8]) -> FixedStr<N> {
    let mut raw = [0u8; N];
    raw.copy_from_slice(&bytes[..N]);
    FixedStr::from_raw(raw)
}

fn clamp_u8(n: usize) -> u8 {
    n.min(usize::from(u8::MAX)) as u8
}

// ---------------------------------------------------------------------------
// Plant endpoint
// ---------------------------------------------------------------------------

/// A write to the plant endpoint, distinguished by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlantRequest {
    /// `max_count == 0` asks for a pushed stream.
    List {
        offset: u16,
        max_count: u8,
        filter: ListFilter,
    },
    Delete {
        plant_id: u16,
    },
    Install(PlantRecord),
}

impl PlantRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        match bytes.len() {
            4 => Ok(Self::List {
                offset: LittleEndian::read_u16(&bytes[0..2]),
                max_count: bytes[2],
                filter: ListFilter::from_wire(bytes[3]),
            }),
            2 => Ok(Self::Delete {
                plant_id: LittleEndian::read_u16(bytes),
            }),
            PLANT_RECORD_SIZE => Ok(Self::Install(PlantRecord::from_bytes(bytes)?)),
            got => Err(WireError::Length {
                what: "plant request",
                expected: PLANT_RECORD_SIZE,
                got,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlantOp {
    Install = 0,
    Delete = 1,
    List = 2,
}

/// Notification emitted after every plant-endpoint mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpResult {
    pub op: PlantOp,
    pub result: PackResult,
    pub plant_id: u16,
    pub version: u16,
}

impl OpResult {
    pub fn encode(&self) -> [u8; OP_RESULT_SIZE] {
        let mut out = [0u8; OP_RESULT_SIZE];
        out[0] = self.op as u8;
        out[1] = self.result.code();
        LittleEndian::write_u16(&mut out[2..4], self.plant_id);
        LittleEndian::write_u16(&mut out[4..6], self.version);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        expect_len("op result", bytes, OP_RESULT_SIZE)?;
        let op = match bytes[0] {
            0 => PlantOp::Install,
            1 => PlantOp::Delete,
            2 => PlantOp::List,
            other => return Err(WireError::UnknownOpcode(other)),
        };
        let result = PackResult::from_code(bytes[1]).ok_or(WireError::UnknownOpcode(bytes[1]))?;
        Ok(Self {
            op,
            result,
            plant_id: LittleEndian::read_u16(&bytes[2..4]),
            version: LittleEndian::read_u16(&bytes[4..6]),
        })
    }
}

/// List frame used both for paginated replies and stream notifications.
pub fn encode_list_frame(total: u16, flags: u8, entries: &[PlantListEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LIST_HEADER_SIZE + LIST_ENTRY_SIZE * entries.len());
    put_u16(&mut buf, total);
    buf.push(clamp_u8(entries.len()));
    buf.push(flags);
    for e in entries.iter().take(usize::from(u8::MAX)) {
        put_u16(&mut buf, e.plant_id);
        put_u16(&mut buf, e.pack_id);
        put_u16(&mut buf, e.version);
        buf.extend_from_slice(e.name.as_bytes());
    }
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub plant_id: u16,
    pub pack_id: u16,
    pub version: u16,
    pub name: FixedStr<16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFrame {
    pub total: u16,
    pub flags: u8,
    pub entries: Vec<ListRow>,
}

pub fn decode_list_frame(bytes: &[u8]) -> Result<ListFrame, WireError> {
    expect_min("list frame", bytes, LIST_HEADER_SIZE)?;
    let returned = usize::from(bytes[2]);
    expect_len("list frame", bytes, LIST_HEADER_SIZE + LIST_ENTRY_SIZE * returned)?;
    let entries = bytes[LIST_HEADER_SIZE..]
        .chunks_exact(LIST_ENTRY_SIZE)
        .map(|c| ListRow {
            plant_id: LittleEndian::read_u16(&c[0..2]),
            pack_id: LittleEndian::read_u16(&c[2..4]),
            version: LittleEndian::read_u16(&c[4..6]),
            name: fixed(&c[6..]),
        })
        .collect();
    Ok(ListFrame {
        total: LittleEndian::read_u16(&bytes[0..2]),
        flags: bytes[3],
        entries,
    })
}

// ---------------------------------------------------------------------------
// Stats endpoint
// ---------------------------------------------------------------------------

pub fn encode_stats(s: &StoreStats) -> [u8; STATS_SIZE] {
    let sat = |v: u64| v.min(u64::from(u32::MAX)) as u32;
    let mut out = [0u8; STATS_SIZE];
    LittleEndian::write_u32(&mut out[0..4], sat(s.total_bytes));
    LittleEndian::write_u32(&mut out[4..8], sat(s.used_bytes));
    LittleEndian::write_u32(&mut out[8..12], sat(s.free_bytes));
    LittleEndian::write_u16(&mut out[12..14], s.plant_count);
    LittleEndian::write_u16(&mut out[14..16], s.custom_plant_count);
    // The built-in pack counts as a pack for clients.
    LittleEndian::write_u16(&mut out[16..18], s.pack_count.saturating_add(1));
    LittleEndian::write_u16(&mut out[18..20], s.builtin_count);
    out[20] = s.status as u8;
    LittleEndian::write_u32(&mut out[22..26], s.change_counter);
    out
}

// ---------------------------------------------------------------------------
// Pack endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackRequest {
    List { offset: u16 },
    Content { pack_id: u16, offset: u8 },
}

impl PackRequest {
    pub const OP_LIST: u8 = 0x01;
    pub const OP_CONTENT: u8 = 0x02;

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        expect_len("pack request", bytes, PACK_REQUEST_SIZE)?;
        let param = LittleEndian::read_u16(&bytes[1..3]);
        match bytes[0] {
            Self::OP_LIST => Ok(Self::List { offset: param }),
            Self::OP_CONTENT => Ok(Self::Content {
                pack_id: param,
                offset: bytes[3],
            }),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> [u8; PACK_REQUEST_SIZE] {
        let (op, param, extra) = match *self {
            Self::List { offset } => (Self::OP_LIST, offset, 0),
            Self::Content { pack_id, offset } => (Self::OP_CONTENT, pack_id, offset),
        };
        let mut out = [op, 0, 0, extra];
        LittleEndian::write_u16(&mut out[1..3], param);
        out
    }
}

/// `total` counts every pack including the built-in one.
pub fn encode_pack_list(total: u16, entries: &[PackSummary]) -> Vec<u8> {
    let entries = &entries[..entries.len().min(MAX_PACK_LIST_ENTRIES)];
    let mut buf = Vec::with_capacity(4 + PACK_LIST_ENTRY_SIZE * entries.len());
    put_u16(&mut buf, total);
    buf.push(entries.len() as u8);
    buf.push(1); // include_builtin
    for p in entries {
        put_u16(&mut buf, p.pack_id);
        put_u16(&mut buf, p.version);
        put_u16(&mut buf, p.plant_count);
        let name: FixedStr<24> = if p.pack_id == BUILTIN_PACK_ID {
            FixedStr::new(BUILTIN_PACK_WIRE_NAME)
        } else {
            p.name.narrow()
        };
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}

/// Up to 16 plant ids of `pack`, starting at `offset`.
pub fn encode_pack_content(pack: &PackRecord, offset: u8) -> Vec<u8> {
    let ids: Vec<u16> = pack
        .plant_ids
        .iter()
        .skip(usize::from(offset))
        .take(MAX_PACK_CONTENT_IDS)
        .copied()
        .collect();
    let mut buf = Vec::with_capacity(8 + 2 * ids.len());
    put_u16(&mut buf, pack.pack_id);
    put_u16(&mut buf, pack.version);
    put_u16(&mut buf, pack.plant_count());
    buf.push(ids.len() as u8);
    buf.push(offset);
    for id in ids {
        put_u16(&mut buf, id);
    }
    buf
}

// ---------------------------------------------------------------------------
// Transfer endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCommand<'a> {
    Start(StartRequest),
    Data {
        offset: u32,
        length: u16,
        payload: &'a [u8],
    },
    Commit,
    Abort,
    Status,
}

impl<'a> TransferCommand<'a> {
    pub const OP_START: u8 = 0x01;
    pub const OP_DATA: u8 = 0x02;
    pub const OP_COMMIT: u8 = 0x03;
    pub const OP_ABORT: u8 = 0x04;
    pub const OP_STATUS: u8 = 0x05;

    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        expect_min("transfer command", bytes, 1)?;
        match bytes[0] {
            Self::OP_START => {
                expect_len("transfer start", bytes, TRANSFER_START_SIZE)?;
                Ok(Self::Start(StartRequest {
                    pack_id: LittleEndian::read_u16(&bytes[1..3]),
                    version: LittleEndian::read_u16(&bytes[3..5]),
                    plant_count: LittleEndian::read_u16(&bytes[5..7]),
                    total_size: LittleEndian::read_u32(&bytes[7..11]),
                    crc32: LittleEndian::read_u32(&bytes[11..15]),
                    name: fixed(&bytes[15..]),
                }))
            }
            Self::OP_DATA => {
                expect_min("transfer data", bytes, TRANSFER_DATA_HEADER_SIZE)?;
                Ok(Self::Data {
                    offset: LittleEndian::read_u32(&bytes[1..5]),
                    length: LittleEndian::read_u16(&bytes[5..7]),
                    payload: &bytes[TRANSFER_DATA_HEADER_SIZE..],
                })
            }
            Self::OP_COMMIT => Ok(Self::Commit),
            Self::OP_ABORT => Ok(Self::Abort),
            Self::OP_STATUS => Ok(Self::Status),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    /// Client-side encoding.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Start(s) => {
                let mut buf = Vec::with_capacity(TRANSFER_START_SIZE);
                buf.push(Self::OP_START);
                put_u16(&mut buf, s.pack_id);
                put_u16(&mut buf, s.version);
                put_u16(&mut buf, s.plant_count);
                put_u32(&mut buf, s.total_size);
                put_u32(&mut buf, s.crc32);
                buf.extend_from_slice(s.name.as_bytes());
                buf
            }
            Self::Data {
                offset,
                length,
                payload,
            } => {
                let mut buf = Vec::with_capacity(TRANSFER_DATA_HEADER_SIZE + payload.len());
                buf.push(Self::OP_DATA);
                put_u32(&mut buf, *offset);
                put_u16(&mut buf, *length);
                buf.extend_from_slice(payload);
                buf
            }
            Self::Commit => vec![Self::OP_COMMIT],
            Self::Abort => vec![Self::OP_ABORT],
            Self::Status => vec![Self::OP_STATUS],
        }
    }
}

pub fn encode_transfer_status(s: &TransferStatus) -> [u8; TRANSFER_STATUS_SIZE] {
    let mut out = [0u8; TRANSFER_STATUS_SIZE];
    out[0] = s.state as u8;
    out[1] = s.progress_pct;
    LittleEndian::write_u16(&mut out[2..4], s.pack_id);
    LittleEndian::write_u32(&mut out[4..8], s.bytes_received);
    LittleEndian::write_u32(&mut out[8..12], s.bytes_expected);
    out[12] = s.last_error.code();
    out
}

pub fn decode_transfer_status(bytes: &[u8]) -> Result<TransferStatus, WireError> {
    expect_len("transfer status", bytes, TRANSFER_STATUS_SIZE)?;
    let state = TransferState::from_code(bytes[0]).ok_or(WireError::UnknownOpcode(bytes[0]))?;
    let last_error = PackResult::from_code(bytes[12]).ok_or(WireError::UnknownOpcode(bytes[12]))?;
    Ok(TransferStatus {
        state,
        progress_pct: bytes[1],
        pack_id: LittleEndian::read_u16(&bytes[2..4]),
        bytes_received: LittleEndian::read_u32(&bytes[4..8]),
        bytes_expected: LittleEndian::read_u32(&bytes[8..12]),
        last_error,
    })
}

// ---------------------------------------------------------------------------
// History endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCommand {
    Query,
    Clear,
}

/// `granularity` stays raw so an unknown value can be answered with
/// [`HistoryStatus::BadType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub command: HistoryCommand,
    pub start: u32,
    pub end: u32,
    pub granularity: u8,
    pub max_records: u8,
    pub fragment_id: u8,
}

impl HistoryRequest {
    pub const CMD_QUERY: u8 = 0x01;
    pub const CMD_CLEAR: u8 = 0x05;

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        expect_len("history request", bytes, HISTORY_REQUEST_SIZE)?;
        let command = match bytes[0] {
            Self::CMD_QUERY => HistoryCommand::Query,
            Self::CMD_CLEAR => HistoryCommand::Clear,
            other => return Err(WireError::UnknownOpcode(other)),
        };
        Ok(Self {
            command,
            start: LittleEndian::read_u32(&bytes[1..5]),
            end: LittleEndian::read_u32(&bytes[5..9]),
            granularity: bytes[9],
            max_records: bytes[10],
            fragment_id: bytes[11],
        })
    }

    pub fn encode(&self) -> [u8; HISTORY_REQUEST_SIZE] {
        let mut out = [0u8; HISTORY_REQUEST_SIZE];
        out[0] = match self.command {
            HistoryCommand::Query => Self::CMD_QUERY,
            HistoryCommand::Clear => Self::CMD_CLEAR,
        };
        LittleEndian::write_u32(&mut out[1..5], self.start);
        LittleEndian::write_u32(&mut out[5..9], self.end);
        out[9] = self.granularity;
        out[10] = self.max_records;
        out[11] = self.fragment_id;
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HistoryStatus {
    Ok = 0,
    BadType = 1,
    BadRange = 2,
    NoData = 3,
    Storage = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryResponse {
    pub status: HistoryStatus,
    pub granularity: u8,
    pub record_count: u8,
    pub fragment_id: u8,
    pub total_fragments: u8,
    pub data: Vec<u8>,
}

impl HistoryResponse {
    pub fn status_only(status: HistoryStatus, granularity: u8) -> Self {
        Self {
            status,
            granularity,
            record_count: 0,
            fragment_id: 0,
            total_fragments: 0,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let data = &self.data[..self.data.len().min(HISTORY_MAX_DATA)];
        let mut buf = Vec::with_capacity(HISTORY_HEADER_SIZE + data.len());
        buf.push(self.status as u8);
        buf.push(self.granularity);
        buf.push(self.record_count);
        buf.push(self.fragment_id);
        buf.push(self.total_fragments);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(data);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        expect_min("history response", bytes, HISTORY_HEADER_SIZE)?;
        let status = match bytes[0] {
            0 => HistoryStatus::Ok,
            1 => HistoryStatus::BadType,
            2 => HistoryStatus::BadRange,
            3 => HistoryStatus::NoData,
            5 => HistoryStatus::Storage,
            other => return Err(WireError::UnknownOpcode(other)),
        };
        Ok(Self {
            status,
            granularity: bytes[1],
            record_count: bytes[2],
            fragment_id: bytes[3],
            total_fragments: bytes[4],
            data: bytes[HISTORY_HEADER_SIZE..].to_vec(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
