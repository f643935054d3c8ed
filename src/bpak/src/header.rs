//! The fixed 4096-byte archive header: preamble, payload hash, signature,
//! metadata table, part directory, meta data blob.
//!
//! | Offset | Size | Field |
//! | ------ | ---- | ----- |
//! | 0      | 4    | magic |
//! | 4      | 2    | version |
//! | 6      | 2    | align |
//! | 8      | 1    | hash_kind |
//! | 9      | 1    | signature_kind |
//! | 10     | 64   | payload_hash (only the first `hash_kind.size()` bytes are meaningful) |
//! | 74     | 2    | signature_sz |
//! | 76     | 512  | signature |
//! | 588    | 384  | meta table (32 * 12 bytes) |
//! | 972    | 1024 | part table (32 * 32 bytes) |
//! | 1996   | 2048 | meta blob |
//! | 4044   | 52   | reserved |

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::limits::{HashKind, Limits, PartFlags, SignatureKind, MAGIC, SIGNATURE_MAX, VERSION};

const OFF_PAYLOAD_HASH: usize = 10;
const PAYLOAD_HASH_MAX: usize = 64;
const OFF_SIGNATURE_SZ: usize = OFF_PAYLOAD_HASH + PAYLOAD_HASH_MAX; // 74
const OFF_SIGNATURE: usize = OFF_SIGNATURE_SZ + 2; // 76
const OFF_META_TABLE: usize = OFF_SIGNATURE + SIGNATURE_MAX; // 588
const META_ENTRY_SIZE: usize = 12;
const OFF_PART_TABLE: usize = OFF_META_TABLE + Limits::DEFAULT.max_meta * META_ENTRY_SIZE; // 972
const PART_ENTRY_SIZE: usize = 32;
const OFF_META_BLOB: usize =
    OFF_PART_TABLE + Limits::DEFAULT.max_parts * PART_ENTRY_SIZE; // 1996

/// A single metadata entry: `(id, part_id_ref)` addresses a byte range
/// within the header's meta blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaEntry {
    pub id: u32,
    pub part_id_ref: u32,
    pub offset: u16,
    pub size: u16,
}

impl MetaEntry {
    fn is_empty(&self) -> bool {
        self.id == 0
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> io::Result<MetaEntry> {
        Ok(MetaEntry {
            id: cursor.read_u32::<LittleEndian>()?,
            part_id_ref: cursor.read_u32::<LittleEndian>()?,
            offset: cursor.read_u16::<LittleEndian>()?,
            size: cursor.read_u16::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cursor: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cursor.write_u32::<LittleEndian>(self.id)?;
        cursor.write_u32::<LittleEndian>(self.part_id_ref)?;
        cursor.write_u16::<LittleEndian>(self.offset)?;
        cursor.write_u16::<LittleEndian>(self.size)?;
        Ok(())
    }
}

/// A single part directory entry. `id == 0` marks an empty slot and
/// terminates iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartEntry {
    pub id: u32,
    pub flags: PartFlags,
    pub pad_bytes: u8,
    pub size: u64,
    pub transport_size: u64,
    pub offset: u64,
}

impl PartEntry {
    fn is_empty(&self) -> bool {
        self.id == 0
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> io::Result<PartEntry> {
        let id = cursor.read_u32::<LittleEndian>()?;
        let flags = PartFlags(cursor.read_u8()?);
        let pad_bytes = cursor.read_u8()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let transport_size = cursor.read_u64::<LittleEndian>()?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        Ok(PartEntry {
            id,
            flags,
            pad_bytes,
            size,
            transport_size,
            offset,
        })
    }

    fn write_to(&self, cursor: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cursor.write_u32::<LittleEndian>(self.id)?;
        cursor.write_u8(self.flags.0)?;
        cursor.write_u8(self.pad_bytes)?;
        cursor.write_u16::<LittleEndian>(0)?;
        cursor.write_u64::<LittleEndian>(self.size)?;
        cursor.write_u64::<LittleEndian>(self.transport_size)?;
        cursor.write_u64::<LittleEndian>(self.offset)?;
        Ok(())
    }

    /// Total span this part occupies in the payload area, including padding.
    pub fn span(&self) -> u64 {
        self.size + self.pad_bytes as u64
    }
}

/// Two supported locations for the header relative to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLocation {
    First,
    Last,
}

/// The in-memory, decoded form of the 4096-byte on-disk header.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub align: u16,
    pub hash_kind: HashKind,
    pub signature_kind: SignatureKind,
    pub payload_hash: [u8; PAYLOAD_HASH_MAX],
    pub signature_sz: u16,
    pub signature: [u8; SIGNATURE_MAX],
    pub meta: [MetaEntry; Limits::DEFAULT.max_meta],
    pub parts: [PartEntry; Limits::DEFAULT.max_parts],
    pub meta_blob: Vec<u8>,
    meta_blob_used: usize,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            version: VERSION,
            align: Limits::DEFAULT.align as u16,
            hash_kind: HashKind::Sha256,
            signature_kind: SignatureKind::None,
            payload_hash: [0u8; PAYLOAD_HASH_MAX],
            signature_sz: 0,
            signature: [0u8; SIGNATURE_MAX],
            meta: [MetaEntry::default(); Limits::DEFAULT.max_meta],
            parts: [PartEntry::default(); Limits::DEFAULT.max_parts],
            meta_blob: vec![0u8; Limits::DEFAULT.meta_blob_size],
            meta_blob_used: 0,
        }
    }
}

impl Header {
    pub fn new(hash_kind: HashKind) -> Header {
        Header {
            hash_kind,
            ..Header::default()
        }
    }

    /// Decode a header from an exact `HEADER_SIZE`-byte buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Header> {
        if buf.len() != Limits::DEFAULT.header_size {
            return Err(Error::BufferTooSmall);
        }

        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        let align = cursor.read_u16::<LittleEndian>()?;
        let hash_kind_raw = cursor.read_u8()?;
        let signature_kind_raw = cursor.read_u8()?;

        let hash_kind = HashKind::from_u8(hash_kind_raw).ok_or(Error::BadHashKind)?;
        let signature_kind = SignatureKind::from_u8(signature_kind_raw).unwrap_or(SignatureKind::None);

        let mut payload_hash = [0u8; PAYLOAD_HASH_MAX];
        cursor.read_exact(&mut payload_hash)?;

        let signature_sz = cursor.read_u16::<LittleEndian>()?;
        let mut signature = [0u8; SIGNATURE_MAX];
        cursor.read_exact(&mut signature)?;

        if signature_sz as usize > SIGNATURE_MAX {
            return Err(Error::CorruptTable);
        }

        debug_assert_eq!(cursor.position() as usize, OFF_META_TABLE);

        let mut meta = [MetaEntry::default(); Limits::DEFAULT.max_meta];
        for slot in meta.iter_mut() {
            *slot = MetaEntry::read_from(&mut cursor)?;
        }

        debug_assert_eq!(cursor.position() as usize, OFF_PART_TABLE);

        let mut parts = [PartEntry::default(); Limits::DEFAULT.max_parts];
        for slot in parts.iter_mut() {
            *slot = PartEntry::read_from(&mut cursor)?;
        }

        debug_assert_eq!(cursor.position() as usize, OFF_META_BLOB);

        let mut meta_blob = vec![0u8; Limits::DEFAULT.meta_blob_size];
        cursor.read_exact(&mut meta_blob)?;

        let mut header = Header {
            version,
            align,
            hash_kind,
            signature_kind,
            payload_hash,
            signature_sz,
            signature,
            meta,
            parts,
            meta_blob,
            meta_blob_used: 0,
        };
        header.meta_blob_used = header.highest_meta_offset();
        header.validate()?;
        Ok(header)
    }

    fn highest_meta_offset(&self) -> usize {
        self.meta
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.offset as usize + m.size as usize)
            .max()
            .unwrap_or(0)
    }

    /// Encode this header into an exact `HEADER_SIZE`-byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Limits::DEFAULT.header_size];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            cursor.write_u32::<LittleEndian>(MAGIC).unwrap();
            cursor.write_u16::<LittleEndian>(self.version).unwrap();
            cursor.write_u16::<LittleEndian>(self.align).unwrap();
            cursor.write_u8(self.hash_kind.as_u8()).unwrap();
            cursor.write_u8(self.signature_kind.as_u8()).unwrap();
            cursor.write_all(&self.payload_hash).unwrap();
            cursor.write_u16::<LittleEndian>(self.signature_sz).unwrap();
            cursor.write_all(&self.signature).unwrap();

            for entry in self.meta.iter() {
                entry.write_to(&mut cursor).unwrap();
            }
            for entry in self.parts.iter() {
                entry.write_to(&mut cursor).unwrap();
            }
            cursor.write_all(&self.meta_blob).unwrap();
            // Remaining bytes (reserved trailer) are left zeroed.
        }
        buf
    }

    /// Checks magic (implicit in `from_bytes`), version, hash kind, and
    /// that every meta entry's blob range falls within capacity.
    pub fn validate(&self) -> Result<()> {
        if self.version != VERSION {
            warn!("header version mismatch: {}", self.version);
            return Err(Error::BadVersion);
        }
        for entry in self.meta.iter() {
            if entry.is_empty() {
                continue;
            }
            let end = entry.offset as usize + entry.size as usize;
            if end > self.meta_blob.len() {
                return Err(Error::CorruptTable);
            }
        }
        Ok(())
    }

    /// Live part entries, in directory order, stopping at the first empty
    /// slot.
    pub fn iterate_parts(&self) -> impl Iterator<Item = &PartEntry> {
        self.parts.iter().take_while(|p| !p.is_empty())
    }

    pub fn iterate_parts_mut(&mut self) -> impl Iterator<Item = &mut PartEntry> {
        self.parts.iter_mut().take_while(|p| !p.is_empty())
    }

    /// Live metadata entries matching `id`, and optionally `part_id_ref`.
    pub fn iterate_meta<'a>(
        &'a self,
        id: u32,
        part_id_ref: Option<u32>,
    ) -> impl Iterator<Item = &'a MetaEntry> + 'a {
        self.meta.iter().take_while(|m| !m.is_empty()).filter(move |m| {
            m.id == id && part_id_ref.map(|r| r == m.part_id_ref).unwrap_or(true)
        })
    }

    pub fn find_part(&self, id: u32) -> Option<&PartEntry> {
        self.iterate_parts().find(|p| p.id == id)
    }

    pub fn find_part_mut(&mut self, id: u32) -> Option<&mut PartEntry> {
        self.iterate_parts_mut().find(|p| p.id == id)
    }

    fn first_empty_meta_slot(&self) -> Option<usize> {
        self.meta.iter().position(|m| m.is_empty())
    }

    fn first_empty_part_slot(&self) -> Option<usize> {
        self.parts.iter().position(|p| p.is_empty())
    }

    /// Reserve `size` bytes within the meta blob for `(id, part_id_ref)` and
    /// copy `data` into them. Reservations are bump-allocated: there is no
    /// in-place resize or reclamation of a removed entry's space.
    pub fn add_meta(&mut self, id: u32, part_id_ref: u32, data: &[u8]) -> Result<()> {
        let size = data.len();
        if self.meta_blob_used + size > self.meta_blob.len() {
            return Err(Error::OutOfSpace);
        }
        let slot = self.first_empty_meta_slot().ok_or(Error::OutOfSpace)?;

        let offset = self.meta_blob_used;
        self.meta_blob[offset..offset + size].copy_from_slice(data);
        self.meta_blob_used += size;

        self.meta[slot] = MetaEntry {
            id,
            part_id_ref,
            offset: offset as u16,
            size: size as u16,
        };
        debug!("add_meta id={:08x} part_id_ref={:08x} size={}", id, part_id_ref, size);
        Ok(())
    }

    pub fn meta_bytes(&self, entry: &MetaEntry) -> &[u8] {
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        &self.meta_blob[start..end]
    }

    /// Append a fresh part entry. The offset is computed from the directory
    /// (sum of prior parts' `size + pad_bytes`), never trusted from a
    /// caller, plus the header's own size when `location` is `First`.
    pub fn add_part(&mut self, id: u32, location: HeaderLocation) -> Result<usize> {
        if self.find_part(id).is_some() {
            return Err(Error::DuplicateId);
        }
        let slot = self.first_empty_part_slot().ok_or(Error::OutOfSpace)?;

        let base: u64 = match location {
            HeaderLocation::First => Limits::DEFAULT.header_size as u64,
            HeaderLocation::Last => 0,
        };
        let offset = base
            + self
                .iterate_parts()
                .map(|p| p.span())
                .sum::<u64>();

        self.parts[slot] = PartEntry {
            id,
            offset,
            ..PartEntry::default()
        };
        debug!("add_part id={:08x} offset={}", id, offset);
        Ok(slot)
    }

    /// Fill in `size`/`flags` for a part slot and compute its padding.
    pub fn set_part_geometry(&mut self, slot: usize, size: u64, flags: PartFlags) {
        let align = self.align as u64;
        let pad_bytes = ((align - size % align) % align) as u8;
        let entry = &mut self.parts[slot];
        entry.size = size;
        entry.pad_bytes = pad_bytes;
        entry.flags = flags;
    }

    /// Sum of `size + pad_bytes` across every live part: the length of the
    /// installed-form payload region.
    pub fn installed_payload_size(&self) -> u64 {
        self.iterate_parts().map(|p| p.span()).sum()
    }

    /// Length of the transport-form payload region: `transport_size` for
    /// parts flagged `TRANSPORT`, `size` otherwise.
    pub fn transport_payload_size(&self) -> u64 {
        self.iterate_parts()
            .map(|p| if p.flags.is_transport() { p.transport_size } else { p.size })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_header() {
        let header = Header::new(HashKind::Sha256);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), Limits::DEFAULT.header_size);

        let decoded = Header::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, VERSION);
        assert_eq!(decoded.hash_kind, HashKind::Sha256);
        assert_eq!(decoded.iterate_parts().count(), 0);
    }

    #[test]
    fn reject_bad_magic() {
        let header = Header::new(HashKind::Sha256);
        let mut bytes = header.to_bytes();
        bytes[0] = 0xFF;
        assert!(matches!(Header::from_bytes(&bytes), Err(Error::BadMagic)));
    }

    #[test]
    fn add_part_computes_offsets() {
        let mut header = Header::new(HashKind::Sha256);
        let id_a = crate::id::stable_hash("kernel");
        let id_b = crate::id::stable_hash("rootfs");

        let slot_a = header.add_part(id_a, HeaderLocation::First).unwrap();
        header.set_part_geometry(slot_a, 5000, PartFlags::default());
        assert_eq!(header.parts[slot_a].offset, Limits::DEFAULT.header_size as u64);
        assert_eq!(header.parts[slot_a].pad_bytes, 8);

        let slot_b = header.add_part(id_b, HeaderLocation::First).unwrap();
        header.set_part_geometry(slot_b, 100, PartFlags::default());
        assert_eq!(
            header.parts[slot_b].offset,
            Limits::DEFAULT.header_size as u64 + 5000 + 8
        );
    }

    #[test]
    fn duplicate_part_id_rejected() {
        let mut header = Header::new(HashKind::Sha256);
        let id = crate::id::stable_hash("kernel");
        header.add_part(id, HeaderLocation::First).unwrap();
        assert!(matches!(
            header.add_part(id, HeaderLocation::First),
            Err(Error::DuplicateId)
        ));
    }

    #[test]
    fn add_meta_bump_allocates() {
        let mut header = Header::new(HashKind::Sha256);
        let id = crate::id::stable_hash("merkle-salt");
        header.add_meta(id, 1, &[1u8; 32]).unwrap();
        let entry = header.iterate_meta(id, Some(1)).next().unwrap();
        assert_eq!(entry.size, 32);
        assert_eq!(header.meta_bytes(entry), &[1u8; 32][..]);
    }

    #[test]
    fn out_of_space_meta_blob() {
        let mut header = Header::new(HashKind::Sha256);
        let big = vec![0u8; Limits::DEFAULT.meta_blob_size + 1];
        assert!(matches!(
            header.add_meta(1, 0, &big),
            Err(Error::OutOfSpace)
        ));
    }

    #[test]
    fn header_bytes_are_exactly_4096() {
        assert_eq!(OFF_META_BLOB + Limits::DEFAULT.meta_blob_size, Limits::DEFAULT.header_size - 52);
    }
}
