//! In-memory plant and pack records and their packed little-endian layouts.
//!
//! The byte layout is the source of truth for interop: a plant record is
//! exactly 156 bytes, a pack header 40 bytes followed by `plant_count`
//! `u16` plant ids.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Serialize, Serializer};

use crate::error::StoreError;

/// Encoded size of a plant record.
pub const PLANT_RECORD_SIZE: usize = 156;

/// Encoded size of the pack header preceding the plant id array.
pub const PACK_HEADER_SIZE: usize = 40;

/// Reserved id meaning "unset" on the wire.
pub const INVALID_ID: u16 = 0xFFFF;

/// Virtual pack holding the built-in catalog.
pub const BUILTIN_PACK_ID: u16 = 0;

// ---------------------------------------------------------------------------
// Fixed-width names
// ---------------------------------------------------------------------------

/// NUL-padded fixed-width byte string.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize>([u8; N]);

impl<const N: usize> FixedStr<N> {
    /// Copy `s` in, truncated on a char boundary so at least one trailing NUL remains.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(N.saturating_sub(1));
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; N];
        buf[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self(buf)
    }

    pub fn from_raw(raw: [u8; N]) -> Self {
        Self(raw)
    }

    /// Re-pack into a different width, keeping the NUL terminator.
    pub fn narrow<const M: usize>(&self) -> FixedStr<M> {
        FixedStr::<M>::new(&self.as_str())
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        String::from_utf8_lossy(&self.0[..len])
    }

    pub fn is_empty(&self) -> bool {
        self.0.first().map_or(true, |&b| b == 0)
    }

    fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        Ok(Self(buf))
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Plant record
// ---------------------------------------------------------------------------

/// Per-species agronomy parameters. Fractional values are fixed-point.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PlantRecord {
    pub plant_id: u16,
    pub pack_id: u16,
    pub version: u16,
    pub common_name: FixedStr<48>,
    pub scientific_name: FixedStr<64>,

    // Crop coefficients ×1000
    pub kc_ini_x1000: u16,
    pub kc_dev_x1000: u16,
    pub kc_mid_x1000: u16,
    pub kc_end_x1000: u16,

    pub root_depth_min_mm: u16,
    pub root_depth_max_mm: u16,

    pub stage_days_ini: u8,
    pub stage_days_dev: u8,
    pub stage_days_mid: u16,
    pub stage_days_end: u8,
    /// 0 annual, 1 perennial, 2 biennial.
    pub growth_cycle: u8,

    pub depletion_fraction_p_x1000: u16,
    pub spacing_row_mm: u16,
    pub spacing_plant_mm: u16,
    pub density_x100: u16,
    pub canopy_max_x1000: u16,

    pub frost_tolerance_c: i8,
    pub temp_opt_min_c: u8,
    pub temp_opt_max_c: u8,
    pub typ_irrig_method_id: u8,

    pub water_need_factor_x100: u16,
    pub irrigation_freq_days: u8,
    pub prefer_area_based: bool,
}

impl PlantRecord {
    /// Check the record-level bounds every stored plant must satisfy.
    pub fn check_bounds(&self) -> Result<(), String> {
        if self.plant_id == INVALID_ID {
            return Err("plant_id 0xFFFF is reserved".into());
        }
        if self.common_name.is_empty() {
            return Err(format!("plant {}: common_name is empty", self.plant_id));
        }
        let kcs = [
            ("kc_ini", self.kc_ini_x1000),
            ("kc_dev", self.kc_dev_x1000),
            ("kc_mid", self.kc_mid_x1000),
            ("kc_end", self.kc_end_x1000),
        ];
        for (name, kc) in kcs {
            if kc > 2000 {
                return Err(format!(
                    "plant {}: {name} {kc} exceeds 2000",
                    self.plant_id
                ));
            }
        }
        if self.root_depth_min_mm > self.root_depth_max_mm {
            return Err(format!(
                "plant {}: root_depth_min ({}) exceeds root_depth_max ({})",
                self.plant_id, self.root_depth_min_mm, self.root_depth_max_mm
            ));
        }
        if self.root_depth_max_mm > 5000 {
            return Err(format!(
                "plant {}: root_depth_max {} exceeds 5000 mm",
                self.plant_id, self.root_depth_max_mm
            ));
        }
        Ok(())
    }

    pub fn season_days(&self) -> u32 {
        u32::from(self.stage_days_ini)
            + u32::from(self.stage_days_dev)
            + u32::from(self.stage_days_mid)
            + u32::from(self.stage_days_end)
    }

    /// FAO-56 crop coefficient ×1000 on day `days` after planting.
    ///
    /// Flat through the initial stage, linear toward `kc_mid` during
    /// development, flat mid-season, linear toward `kc_end` in the late
    /// stage, and `kc_end` once the season is over.
    pub fn kc_x1000_at(&self, days: u32) -> u16 {
        let ini = u32::from(self.stage_days_ini);
        let dev = u32::from(self.stage_days_dev);
        let mid = u32::from(self.stage_days_mid);
        let end = u32::from(self.stage_days_end);

        if days < ini {
            return self.kc_ini_x1000;
        }
        let days = days - ini;
        if days < dev {
            return lerp(self.kc_dev_x1000, self.kc_mid_x1000, days, dev);
        }
        let days = days - dev;
        if days < mid {
            return self.kc_mid_x1000;
        }
        let days = days - mid;
        if days < end {
            return lerp(self.kc_mid_x1000, self.kc_end_x1000, days, end);
        }
        self.kc_end_x1000
    }

    /// Effective root depth in mm, growing linearly over the whole season.
    pub fn root_depth_mm_at(&self, days: u32) -> u16 {
        let season = self.season_days();
        if season == 0 || days >= season {
            return self.root_depth_max_mm;
        }
        lerp(self.root_depth_min_mm, self.root_depth_max_mm, days, season)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PLANT_RECORD_SIZE);
        // Vec<u8> writes cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.plant_id)?;
        w.write_u16::<LittleEndian>(self.pack_id)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_u16::<LittleEndian>(0)?; // reserved
        w.write_all(self.common_name.as_bytes())?;
        w.write_all(self.scientific_name.as_bytes())?;

        w.write_u16::<LittleEndian>(self.kc_ini_x1000)?;
        w.write_u16::<LittleEndian>(self.kc_dev_x1000)?;
        w.write_u16::<LittleEndian>(self.kc_mid_x1000)?;
        w.write_u16::<LittleEndian>(self.kc_end_x1000)?;
        w.write_u16::<LittleEndian>(self.root_depth_min_mm)?;
        w.write_u16::<LittleEndian>(self.root_depth_max_mm)?;

        w.write_u8(self.stage_days_ini)?;
        w.write_u8(self.stage_days_dev)?;
        w.write_u16::<LittleEndian>(self.stage_days_mid)?;
        w.write_u8(self.stage_days_end)?;
        w.write_u8(self.growth_cycle)?;

        w.write_u16::<LittleEndian>(self.depletion_fraction_p_x1000)?;
        w.write_u16::<LittleEndian>(self.spacing_row_mm)?;
        w.write_u16::<LittleEndian>(self.spacing_plant_mm)?;
        w.write_u16::<LittleEndian>(self.density_x100)?;
        w.write_u16::<LittleEndian>(self.canopy_max_x1000)?;

        w.write_i8(self.frost_tolerance_c)?;
        w.write_u8(self.temp_opt_min_c)?;
        w.write_u8(self.temp_opt_max_c)?;
        w.write_u8(self.typ_irrig_method_id)?;

        w.write_u16::<LittleEndian>(self.water_need_factor_x100)?;
        w.write_u8(self.irrigation_freq_days)?;
        w.write_u8(u8::from(self.prefer_area_based))?;
        Ok(())
    }

    /// Decode one raw 156-byte record (no envelope).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != PLANT_RECORD_SIZE {
            return Err(StoreError::SizeMismatch {
                declared: bytes.len() as u32,
                expected: PLANT_RECORD_SIZE as u32,
            });
        }
        let mut r = Cursor::new(bytes);
        Ok(Self::read_from(&mut r)?)
    }

    fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let plant_id = r.read_u16::<LittleEndian>()?;
        let pack_id = r.read_u16::<LittleEndian>()?;
        let version = r.read_u16::<LittleEndian>()?;
        let _reserved = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            plant_id,
            pack_id,
            version,
            common_name: FixedStr::read_from(r)?,
            scientific_name: FixedStr::read_from(r)?,
            kc_ini_x1000: r.read_u16::<LittleEndian>()?,
            kc_dev_x1000: r.read_u16::<LittleEndian>()?,
            kc_mid_x1000: r.read_u16::<LittleEndian>()?,
            kc_end_x1000: r.read_u16::<LittleEndian>()?,
            root_depth_min_mm: r.read_u16::<LittleEndian>()?,
            root_depth_max_mm: r.read_u16::<LittleEndian>()?,
            stage_days_ini: r.read_u8()?,
            stage_days_dev: r.read_u8()?,
            stage_days_mid: r.read_u16::<LittleEndian>()?,
            stage_days_end: r.read_u8()?,
            growth_cycle: r.read_u8()?,
            depletion_fraction_p_x1000: r.read_u16::<LittleEndian>()?,
            spacing_row_mm: r.read_u16::<LittleEndian>()?,
            spacing_plant_mm: r.read_u16::<LittleEndian>()?,
            density_x100: r.read_u16::<LittleEndian>()?,
            canopy_max_x1000: r.read_u16::<LittleEndian>()?,
            frost_tolerance_c: r.read_i8()?,
            temp_opt_min_c: r.read_u8()?,
            temp_opt_max_c: r.read_u8()?,
            typ_irrig_method_id: r.read_u8()?,
            water_need_factor_x100: r.read_u16::<LittleEndian>()?,
            irrigation_freq_days: r.read_u8()?,
            prefer_area_based: r.read_u8()? != 0,
        })
    }
}

fn lerp(from: u16, to: u16, step: u32, span: u32) -> u16 {
    if span == 0 {
        return to;
    }
    let from = i64::from(from);
    let to = i64::from(to);
    let v = from + (to - from) * i64::from(step) / i64::from(span);
    v.clamp(0, i64::from(u16::MAX)) as u16
}

/// Iterates a buffer of back-to-back raw plant records.
///
/// A trailing partial record yields one `Truncated` error and ends the
/// iteration.
pub struct PlantRecords<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PlantRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl Iterator for PlantRecords<'_> {
    type Item = Result<PlantRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < PLANT_RECORD_SIZE {
            self.pos = self.buf.len();
            return Some(Err(StoreError::Truncated(rest.len())));
        }
        self.pos += PLANT_RECORD_SIZE;
        Some(PlantRecord::from_bytes(&rest[..PLANT_RECORD_SIZE]))
    }
}

// ---------------------------------------------------------------------------
// Pack record
// ---------------------------------------------------------------------------

/// A named bundle of plants. The pack is an index: the plant records live
/// in their own files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PackRecord {
    pub pack_id: u16,
    pub version: u16,
    pub name: FixedStr<32>,
    pub plant_ids: Vec<u16>,
}

impl PackRecord {
    pub fn plant_count(&self) -> u16 {
        self.plant_ids.len().min(usize::from(u16::MAX)) as u16
    }

    pub fn encoded_len(&self) -> usize {
        PACK_HEADER_SIZE + 2 * self.plant_ids.len()
    }

    pub fn check_bounds(&self) -> Result<(), String> {
        if self.pack_id == BUILTIN_PACK_ID || self.pack_id == INVALID_ID {
            return Err(format!("pack_id {} is reserved", self.pack_id));
        }
        if self.plant_ids.len() > usize::from(u16::MAX) {
            return Err(format!(
                "pack {}: {} plant ids do not fit the header",
                self.pack_id,
                self.plant_ids.len()
            ));
        }
        Ok(())
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.pack_id)?;
        w.write_u16::<LittleEndian>(self.version)?;
        w.write_all(self.name.as_bytes())?;
        w.write_u16::<LittleEndian>(self.plant_count())?;
        w.write_u16::<LittleEndian>(0)?; // reserved
        for id in &self.plant_ids {
            w.write_u16::<LittleEndian>(*id)?;
        }
        Ok(())
    }

    /// Decode a header plus id array; the length must match `plant_count` exactly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < PACK_HEADER_SIZE {
            return Err(StoreError::Truncated(bytes.len()));
        }
        let mut r = Cursor::new(bytes);
        let pack_id = r.read_u16::<LittleEndian>()?;
        let version = r.read_u16::<LittleEndian>()?;
        let name = FixedStr::read_from(&mut r)?;
        let count = r.read_u16::<LittleEndian>()?;
        let _reserved = r.read_u16::<LittleEndian>()?;

        let expected = PACK_HEADER_SIZE + 2 * usize::from(count);
        if bytes.len() != expected {
            return Err(StoreError::SizeMismatch {
                declared: bytes.len() as u32,
                expected: expected as u32,
            });
        }
        let mut plant_ids = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            plant_ids.push(r.read_u16::<LittleEndian>()?);
        }
        Ok(Self {
            pack_id,
            version,
            name,
            plant_ids,
        })
    }
}

// ---------------------------------------------------------------------------
// Listing views
// ---------------------------------------------------------------------------

/// Where a listed plant comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlantSource {
    /// Mirror of a ROM catalog entry.
    Builtin,
    /// Installed as part of a pack.
    Pack,
    /// Standalone plant installed by the client.
    Custom,
}

impl PlantSource {
    pub fn classify(plant_id: u16, pack_id: u16, builtin_count: u16) -> Self {
        if pack_id != BUILTIN_PACK_ID {
            Self::Pack
        } else if plant_id >= 1 && plant_id <= builtin_count {
            Self::Builtin
        } else {
            Self::Custom
        }
    }
}

/// One row of a plant listing, with the 16-byte short name used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlantListEntry {
    pub plant_id: u16,
    pub pack_id: u16,
    pub version: u16,
    pub source: PlantSource,
    pub name: FixedStr<16>,
}

/// One row of a pack listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackSummary {
    pub pack_id: u16,
    pub version: u16,
    pub plant_count: u16,
    pub name: FixedStr<32>,
}

impl From<&PackRecord> for PackSummary {
    fn from(p: &PackRecord) -> Self {
        Self {
            pack_id: p.pack_id,
            version: p.version,
            plant_count: p.plant_count(),
            name: p.name,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
