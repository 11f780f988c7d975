//! File envelope shared by plant and pack blobs.
//!
//! ```text
//! [magic:u32][schema:u8][reserved:u8×3][crc32:u32][payload_size:u32][payload]
//! ```
//!
//! All fields little-endian. The CRC-32 (IEEE, reflected) covers the payload
//! only.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;

use super::record::{PackRecord, PlantRecord, PLANT_RECORD_SIZE};
use crate::error::StoreError;

/// "PLNT"
pub const MAGIC_PLANT: u32 = 0x504C_4E54;
/// "PACK"
pub const MAGIC_PACK: u32 = 0x5041_434B;

pub const SCHEMA_VERSION: u8 = 1;
pub const ENVELOPE_HEADER_SIZE: usize = 16;

/// A record type that can live inside the file envelope.
pub trait Envelope: Sized + PartialEq {
    const MAGIC: u32;
    /// Payload size when it does not depend on the content.
    const FIXED_PAYLOAD: Option<usize>;
    /// Human-readable kind for logs.
    const KIND: &'static str;

    fn check_invariants(&self) -> Result<(), String>;
    fn write_payload(&self, out: &mut Vec<u8>);
    fn read_payload(payload: &[u8]) -> Result<Self, StoreError>;
}

impl Envelope for PlantRecord {
    const MAGIC: u32 = MAGIC_PLANT;
    const FIXED_PAYLOAD: Option<usize> = Some(PLANT_RECORD_SIZE);
    const KIND: &'static str = "plant";

    fn check_invariants(&self) -> Result<(), String> {
        self.check_bounds()
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        let _ = self.write_to(out);
    }

    fn read_payload(payload: &[u8]) -> Result<Self, StoreError> {
        PlantRecord::from_bytes(payload)
    }
}

impl Envelope for PackRecord {
    const MAGIC: u32 = MAGIC_PACK;
    const FIXED_PAYLOAD: Option<usize> = None;
    const KIND: &'static str = "pack";

    fn check_invariants(&self) -> Result<(), String> {
        self.check_bounds()
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        let _ = self.write_to(out);
    }

    fn read_payload(payload: &[u8]) -> Result<Self, StoreError> {
        PackRecord::from_bytes(payload)
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Serialize `record` into a complete envelope.
pub fn encode<T: Envelope>(record: &T) -> Result<Vec<u8>, StoreError> {
    record
        .check_invariants()
        .map_err(StoreError::EncodeInvariant)?;

    let mut payload = Vec::with_capacity(T::FIXED_PAYLOAD.unwrap_or(64));
    record.write_payload(&mut payload);

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    out.write_u32::<LittleEndian>(T::MAGIC)?;
    out.write_u8(SCHEMA_VERSION)?;
    out.extend_from_slice(&[0u8; 3]);
    out.write_u32::<LittleEndian>(crc32(&payload))?;
    out.write_u32::<LittleEndian>(payload.len() as u32)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

struct Header {
    magic: u32,
    schema: u8,
    crc: u32,
    payload_size: u32,
}

fn read_header(bytes: &[u8]) -> Result<Header, StoreError> {
    if bytes.len() < ENVELOPE_HEADER_SIZE {
        return Err(StoreError::Truncated(bytes.len()));
    }
    let mut r = Cursor::new(bytes);
    let magic = r.read_u32::<LittleEndian>()?;
    let schema = r.read_u8()?;
    let mut reserved = [0u8; 3];
    std::io::Read::read_exact(&mut r, &mut reserved)?;
    let crc = r.read_u32::<LittleEndian>()?;
    let payload_size = r.read_u32::<LittleEndian>()?;
    Ok(Header {
        magic,
        schema,
        crc,
        payload_size,
    })
}

/// Parse an envelope holding a `T`.
///
/// Checks run in a fixed order: header length, magic, schema, declared
/// size, CRC, then the record's own layout.
pub fn decode<T: Envelope>(bytes: &[u8]) -> Result<T, StoreError> {
    let header = read_header(bytes)?;
    if header.magic != T::MAGIC {
        return Err(StoreError::BadMagic(header.magic));
    }
    // Only one schema exists; there is nothing to up-convert from.
    if header.schema != SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema(header.schema));
    }

    let declared = header.payload_size as usize;
    let available = bytes.len() - ENVELOPE_HEADER_SIZE;
    if available < declared {
        return Err(StoreError::Truncated(bytes.len()));
    }
    if available > declared {
        return Err(StoreError::SizeMismatch {
            declared: header.payload_size,
            expected: available as u32,
        });
    }
    if let Some(fixed) = T::FIXED_PAYLOAD {
        if declared != fixed {
            return Err(StoreError::SizeMismatch {
                declared: header.payload_size,
                expected: fixed as u32,
            });
        }
    }

    let payload = &bytes[ENVELOPE_HEADER_SIZE..];
    let computed = crc32(payload);
    if computed != header.crc {
        return Err(StoreError::CrcMismatch {
            stored: header.crc,
            computed,
        });
    }
    T::read_payload(payload)
}

/// Either kind of blob, for callers that do not know what a file holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
    Plant(PlantRecord),
    Pack(PackRecord),
}

pub fn decode_any(bytes: &[u8]) -> Result<Blob, StoreError> {
    let header = read_header(bytes)?;
    match header.magic {
        MAGIC_PLANT => decode::<PlantRecord>(bytes).map(Blob::Plant),
        MAGIC_PACK => decode::<PackRecord>(bytes).map(Blob::Pack),
        other => Err(StoreError::BadMagic(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::record::tests::tomato;
    use crate::pack::record::FixedStr;

    fn herbs() -> PackRecord {
        PackRecord {
            pack_id: 7,
            version: 1,
            name: FixedStr::new("Herbs"),
            plant_ids: vec![100, 101, 102],
        }
    }

    // -- Round trip ---------------------------------------------------------

    #[test]
    fn plant_envelope_round_trip() {
        let p = tomato(42, 0, 3);
        let bytes = encode(&p).unwrap();
        assert_eq!(bytes.len(), ENVELOPE_HEADER_SIZE + PLANT_RECORD_SIZE);
        assert_eq!(&bytes[0..4], &MAGIC_PLANT.to_le_bytes());
        assert_eq!(bytes[4], SCHEMA_VERSION);
        assert_eq!(decode::<PlantRecord>(&bytes).unwrap(), p);
        assert_eq!(encode(&decode::<PlantRecord>(&bytes).unwrap()).unwrap(), bytes);
    }

    #[test]
    fn pack_envelope_round_trip() {
        let bytes = encode(&herbs()).unwrap();
        assert_eq!(decode_any(&bytes).unwrap(), Blob::Pack(herbs()));
    }

    #[test]
    fn crc_matches_reference_vector() {
        // Standard CRC-32 check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    // -- Encode rejects ----------------------------------------------------

    #[test]
    fn encode_rejects_invariant_violation() {
        let mut p = tomato(42, 0, 3);
        p.kc_end_x1000 = 2500;
        assert!(matches!(encode(&p), Err(StoreError::EncodeInvariant(_))));

        let mut pack = herbs();
        pack.pack_id = 0;
        assert!(matches!(encode(&pack), Err(StoreError::EncodeInvariant(_))));
    }

    // -- Decode rejects ----------------------------------------------------

    #[test]
    fn decode_short_header_is_truncated() {
        assert!(matches!(
            decode::<PlantRecord>(&[0u8; 10]),
            Err(StoreError::Truncated(10))
        ));
    }

    #[test]
    fn decode_wrong_magic() {
        let bytes = encode(&herbs()).unwrap();
        assert!(matches!(
            decode::<PlantRecord>(&bytes),
            Err(StoreError::BadMagic(MAGIC_PACK))
        ));
    }

    #[test]
    fn decode_rejects_newer_and_zero_schema() {
        let mut bytes = encode(&tomato(1, 7, 1)).unwrap();
        bytes[4] = 2;
        assert!(matches!(
            decode::<PlantRecord>(&bytes),
            Err(StoreError::UnsupportedSchema(2))
        ));
        bytes[4] = 0;
        assert!(matches!(
            decode::<PlantRecord>(&bytes),
            Err(StoreError::UnsupportedSchema(0))
        ));
    }

    #[test]
    fn decode_truncated_payload() {
        let bytes = encode(&tomato(1, 7, 1)).unwrap();
        assert!(matches!(
            decode::<PlantRecord>(&bytes[..100]),
            Err(StoreError::Truncated(100))
        ));
    }

    #[test]
    fn decode_declared_size_mismatch() {
        let mut bytes = encode(&tomato(1, 7, 1)).unwrap();
        bytes.truncate(ENVELOPE_HEADER_SIZE + 150);
        bytes[12..16].copy_from_slice(&150u32.to_le_bytes());
        assert!(matches!(
            decode::<PlantRecord>(&bytes),
            Err(StoreError::SizeMismatch {
                declared: 150,
                expected: 156
            })
        ));
    }

    #[test]
    fn decode_flipped_payload_bit_is_crc_mismatch() {
        let mut bytes = encode(&tomato(1, 7, 1)).unwrap();
        bytes[ENVELOPE_HEADER_SIZE + 20] ^= 0x01;
        assert!(matches!(
            decode::<PlantRecord>(&bytes),
            Err(StoreError::CrcMismatch { .. })
        ));
    }
}
