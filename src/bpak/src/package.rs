//! Package facade: open/close an archive, hold its header in memory plus a
//! backing I/O handle, and drive add/update/sign/transport operations.
//!
//! Mirrors the original's unsynchronized `FILE*`-per-package model: a
//! `Package` is not `Sync` and is meant to be driven from one logical
//! thread at a time. Backing storage is read whole into memory on open,
//! the same discipline the teacher's `PeParser::open` uses for its PE
//! images.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::hash::{header_hash, payload_hash, Digest};
use crate::header::{Header, HeaderLocation, PartEntry};
use crate::id::stable_hash;
use crate::limits::{HashKind, Limits, PartFlags};
use crate::merkle::{MemoryMerkleStore, MerkleBuilder, MerkleStore, BLOCK_SIZE, SALT_SIZE};
use crate::transport;

/// The key under which a part's declared encode/decode transport
/// algorithm ids are stored, keyed to that part's id (`part_id_ref`).
const META_TRANSPORT_ENCODE: &str = "bpak-transport-encode";
const META_TRANSPORT_DECODE: &str = "bpak-transport-decode";
const META_MERKLE_SALT: &str = "merkle-salt";
const META_MERKLE_ROOT_HASH: &str = "merkle-root-hash";
const META_KEY_ID: &str = "bpak-key-id";

/// A package wraps a fully materialized archive: the decoded header plus
/// the raw payload bytes backing it. This is the sole mutable view of the
/// header in memory until the package is closed (dropped).
pub struct Package {
    header: Header,
    location: HeaderLocation,
    /// Installed-form payload bytes, indexed by each part's `offset`
    /// relative to the start of the payload region (i.e. independent of
    /// `FIRST`/`LAST` header placement).
    payload: Vec<u8>,
}

impl Package {
    /// A fresh, uninitialized package: empty header, no parts, ready for
    /// `add_file`/`add_key` in write mode.
    pub fn create(hash_kind: HashKind, location: HeaderLocation) -> Package {
        Package {
            header: Header::new(hash_kind),
            location,
            payload: Vec::new(),
        }
    }

    /// Open a backing file, probing for the header at the front, then at
    /// the fixed tail offset (`Limits::DEFAULT.header_size` bytes from
    /// end), matching the original's front-then-tail probe. If neither
    /// location validates, an empty `Package` in `FIRST` layout is
    /// returned (write mode still usable).
    pub fn open(path: &Path) -> Result<Package> {
        info!("opening BPAK file {}", path.display());
        let mut file = File::open(path).map_err(|_| Error::NotFound)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(Error::ReadError)?;
        Package::from_bytes(&data)
    }

    /// Build a package from a fully materialized archive image, probing
    /// head then tail exactly as `open` does against a file.
    pub fn from_bytes(data: &[u8]) -> Result<Package> {
        let header_size = Limits::DEFAULT.header_size;

        if data.len() >= header_size {
            if let Ok(header) = Header::from_bytes(&data[..header_size]) {
                let payload = data[header_size..].to_vec();
                debug!("header found at head, {} parts", header.iterate_parts().count());
                return Ok(Package {
                    header,
                    location: HeaderLocation::First,
                    payload,
                });
            }
        }

        if data.len() >= header_size {
            let tail_start = data.len() - header_size;
            if let Ok(header) = Header::from_bytes(&data[tail_start..]) {
                let payload = data[..tail_start].to_vec();
                debug!("header found at tail, {} parts", header.iterate_parts().count());
                return Ok(Package {
                    header,
                    location: HeaderLocation::Last,
                    payload,
                });
            }
        }

        info!("no valid header found, starting uninitialized package");
        Ok(Package {
            header: Header::new(HashKind::Sha256),
            location: HeaderLocation::First,
            payload: Vec::new(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn location(&self) -> HeaderLocation {
        self.location
    }

    /// Serialize the whole archive (header plus payload, in the package's
    /// current layout) to bytes, as `close` followed by a fresh `open`
    /// would see it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_bytes = self.header.to_bytes();
        match self.location {
            HeaderLocation::First => {
                let mut out = header_bytes;
                out.extend_from_slice(&self.payload);
                out
            }
            HeaderLocation::Last => {
                let mut out = self.payload.clone();
                out.extend_from_slice(&header_bytes);
                out
            }
        }
    }

    /// Write the whole archive out to `path`, truncating any existing
    /// file. Release of the backing handle happens implicitly when the
    /// returned `File` is dropped.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).map_err(Error::WriteError)?;
        file.write_all(&self.to_bytes()).map_err(Error::WriteError)?;
        Ok(())
    }

    fn part_bytes(&self, part: &PartEntry) -> Result<&[u8]> {
        let start = self.payload_relative_offset(part);
        let end = start + part.span() as usize;
        self.payload
            .get(start..end)
            .ok_or(Error::Truncated)
    }

    fn payload_relative_offset(&self, part: &PartEntry) -> usize {
        match self.location {
            HeaderLocation::First => (part.offset as usize) - Limits::DEFAULT.header_size,
            HeaderLocation::Last => part.offset as usize,
        }
    }

    /// Append a part with bytes copied from `data`. Zero-pads to `ALIGN`,
    /// but does not itself recompute the payload hash or rewrite the
    /// header — callers batch those through `update_hash`.
    fn append_part_bytes(&mut self, id: u32, data: &[u8], flags: PartFlags) -> Result<usize> {
        let slot = self.header.add_part(id, self.location)?;
        self.header.set_part_geometry(slot, data.len() as u64, flags);

        self.payload.extend_from_slice(data);
        let pad = self.header.parts[slot].pad_bytes as usize;
        self.payload.resize(self.payload.len() + pad, 0);

        debug!("appended part id={:08x} size={} pad={}", id, data.len(), pad);
        Ok(slot)
    }

    /// Append a part with bytes read from `path`, named `name` (folded
    /// through `stable_hash`).
    pub fn add_file(&mut self, path: &Path, name: &str, flags: PartFlags) -> Result<u32> {
        let mut file = File::open(path).map_err(|_| Error::NotFound)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(Error::ReadError)?;
        self.add_file_from_bytes(&data, name, flags)
    }

    /// In-memory counterpart to `add_file`, used directly by tests and by
    /// `MemoryStore`-backed callers that never touch a filesystem.
    pub fn add_file_from_bytes(&mut self, data: &[u8], name: &str, flags: PartFlags) -> Result<u32> {
        let id = stable_hash(name);
        self.append_part_bytes(id, data, flags)?;
        Ok(id)
    }

    /// `add_file` followed by a Merkle tree built over the new part,
    /// appended as a sibling part named `"<name>-hash-tree"` with
    /// `merkle-salt` and `merkle-root-hash` metadata keyed to the
    /// original part's id.
    pub fn add_file_with_merkle_tree(
        &mut self,
        path: &Path,
        name: &str,
        flags: PartFlags,
    ) -> Result<u32> {
        let mut file = File::open(path).map_err(|_| Error::NotFound)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(Error::ReadError)?;
        self.add_file_with_merkle_tree_from_bytes(&data, name, flags)
    }

    pub fn add_file_with_merkle_tree_from_bytes(
        &mut self,
        data: &[u8],
        name: &str,
        flags: PartFlags,
    ) -> Result<u32> {
        let part_id = self.add_file_from_bytes(data, name, flags)?;

        let mut salt = [0u8; SALT_SIZE];
        getrandom(&mut salt);

        let tree_size = crate::merkle::tree_size(data.len() as u64);
        let mut store = MemoryMerkleStore::new(tree_size);
        let mut builder = MerkleBuilder::new(salt, data.len() as u64);
        for chunk in data.chunks(BLOCK_SIZE as usize) {
            builder.write(chunk, &mut store)?;
        }
        let root = builder.finish(&mut store)?;

        let tree_name = format!("{}-hash-tree", name);
        self.add_file_from_bytes(&store.buf, &tree_name, PartFlags::default())?;

        self.header.add_meta(stable_hash(META_MERKLE_SALT), part_id, &salt)?;
        self.header
            .add_meta(stable_hash(META_MERKLE_ROOT_HASH), part_id, &root)?;

        info!("built merkle tree for part {:08x}, root={:02x?}", part_id, &root[..4]);
        Ok(part_id)
    }

    /// Append a DER-encoded public key as a part.
    pub fn add_key(&mut self, path: &Path, name: &str, flags: PartFlags) -> Result<u32> {
        self.add_file(path, name, flags)
    }

    pub fn add_key_from_bytes(&mut self, der: &[u8], name: &str, flags: PartFlags) -> Result<u32> {
        self.add_file_from_bytes(der, name, flags)
    }

    /// Copy `raw_signature` into `header.signature`, set its length, and
    /// rewrite the header. No hashing or verification happens here: the
    /// caller must have already produced the signature over a header hash
    /// obtained from `update_hash`.
    pub fn sign(&mut self, raw_signature: &[u8]) -> Result<()> {
        if raw_signature.len() > crate::limits::SIGNATURE_MAX {
            return Err(Error::BufferTooSmall);
        }
        self.header.signature = [0u8; crate::limits::SIGNATURE_MAX];
        self.header.signature[..raw_signature.len()].copy_from_slice(raw_signature);
        self.header.signature_sz = raw_signature.len() as u16;
        Ok(())
    }

    pub fn set_key_id(&mut self, key_id: u32) -> Result<()> {
        self.header.add_meta(stable_hash(META_KEY_ID), 0, &key_id.to_le_bytes())
    }

    /// Recompute the payload hash, then optionally compute and return the
    /// header hash. Callers must call this (payload hash first) before
    /// signing, otherwise the signed header commits to a stale payload
    /// digest.
    pub fn update_hash(&mut self, want_header_hash: bool) -> Result<Option<Digest>> {
        self.update_hash_impl(want_header_hash, false)
    }

    /// Like `update_hash`, but for a package whose payload is currently in
    /// transport form: `TRANSPORT`-flagged parts occupy `transport_size`
    /// bytes on disk rather than their installed `span()`.
    fn update_hash_transport_form(&mut self) -> Result<()> {
        self.update_hash_impl(false, true)?;
        Ok(())
    }

    fn update_hash_impl(&mut self, want_header_hash: bool, transport_form: bool) -> Result<Option<Digest>> {
        let payload = &self.payload;
        let location = self.location;
        let header_size = Limits::DEFAULT.header_size;

        let digest = payload_hash(&self.header, transport_form, |offset, span| {
            let start = match location {
                HeaderLocation::First => (offset as usize) - header_size,
                HeaderLocation::Last => offset as usize,
            };
            let end = start + span as usize;
            payload
                .get(start..end)
                .map(|b| b.to_vec())
                .ok_or(Error::Truncated)
        })?;

        let width = self.header.hash_kind.size();
        self.header.payload_hash = [0u8; 64];
        self.header.payload_hash[..width].copy_from_slice(digest.as_bytes());
        debug!("recomputed payload hash ({} bytes)", width);

        if want_header_hash {
            Ok(Some(header_hash(&self.header)?))
        } else {
            Ok(None)
        }
    }

    /// Sum of `size + pad_bytes` over all parts: the installed-form
    /// payload length.
    pub fn installed_size(&self) -> u64 {
        self.header.installed_payload_size()
    }

    /// Header size plus each part's `transport_size` (if `TRANSPORT`) or
    /// `size` otherwise: the transport-form archive length.
    pub fn transport_size(&self) -> u64 {
        Limits::DEFAULT.header_size as u64 + self.header.transport_payload_size()
    }

    /// Declare the encode/decode transport algorithms for a part, stored
    /// as metadata keyed to the part's id.
    pub fn set_transport_algorithm(&mut self, part_id: u32, encode_name: &str, decode_name: &str) -> Result<()> {
        let encode_id = stable_hash(encode_name);
        let decode_id = stable_hash(decode_name);
        self.header
            .add_meta(stable_hash(META_TRANSPORT_ENCODE), part_id, &encode_id.to_le_bytes())?;
        self.header
            .add_meta(stable_hash(META_TRANSPORT_DECODE), part_id, &decode_id.to_le_bytes())?;
        if let Some(part) = self.header.find_part_mut(part_id) {
            part.flags.set(PartFlags::TRANSPORT, true);
        }
        Ok(())
    }

    fn transport_algorithm_for(&self, part_id: u32, meta_key: &str) -> Option<u32> {
        let key_id = stable_hash(meta_key);
        let entry = self.header.iterate_meta(key_id, Some(part_id)).next()?;
        let bytes = self.header.meta_bytes(entry);
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Drive the transport codec end to end across every part, producing
    /// a new package in transport form. `origin`, if supplied, backs
    /// algorithms that need a reference stream.
    pub fn transport_encode(&self, origin: Option<&Package>) -> Result<Package> {
        let mut output = Package {
            header: self.header.clone(),
            location: self.location,
            payload: Vec::new(),
        };

        for (slot, part) in self.header.parts.iter().enumerate() {
            if part.id == 0 {
                break;
            }
            let installed = self.part_bytes(part)?;

            if !part.flags.is_transport() {
                output.payload.extend_from_slice(installed);
                continue;
            }

            let algorithm_id = self
                .transport_algorithm_for(part.id, META_TRANSPORT_ENCODE)
                .unwrap_or_else(|| stable_hash(transport::names::NOP));

            let origin_bytes = origin
                .and_then(|o| o.header.find_part(part.id).map(|p| (o, p)))
                .and_then(|(o, p)| o.part_bytes(p).ok());

            let encoded = transport::encode_part(algorithm_id, installed, origin_bytes)?;
            debug!(
                "transport encode part {:08x}: {} -> {} bytes",
                part.id,
                installed.len(),
                encoded.len()
            );
            output.header.parts[slot].transport_size = encoded.len() as u64;
            output.payload.extend_from_slice(&encoded);
        }

        output.recompute_offsets();
        output.update_hash_transport_form()?;
        Ok(output)
    }

    /// Recompute every live part's `offset` from the directory itself
    /// (sum of prior parts' on-disk span, transport-form-aware), the same
    /// "never trust an external caller" discipline `add_part` applies.
    fn recompute_offsets(&mut self) {
        let header_size = Limits::DEFAULT.header_size as u64;
        let base = match self.location {
            HeaderLocation::First => header_size,
            HeaderLocation::Last => 0,
        };
        let mut running = base;
        for slot in 0..self.header.parts.len() {
            if self.header.parts[slot].id == 0 {
                break;
            }
            self.header.parts[slot].offset = running;
            let span = if self.header.parts[slot].flags.is_transport() {
                self.header.parts[slot].transport_size
            } else {
                self.header.parts[slot].span()
            };
            running += span;
        }
    }

    /// Decode a transport-form archive back to installed form, optionally
    /// against `origin`. The output header is finalized (no `TRANSPORT`
    /// flags, zeroed `transport_size`) and its payload hash recomputed
    /// over the reconstructed bytes.
    pub fn transport_decode(&self, origin: Option<&Package>) -> Result<Package> {
        let mut output_header = self.header.clone();
        let mut output_payload = Vec::new();

        let mut transport_cursor: Vec<(usize, u64)> = Vec::new();
        {
            let mut running = 0u64;
            for (slot, part) in self.header.parts.iter().enumerate() {
                if part.id == 0 {
                    break;
                }
                transport_cursor.push((slot, running));
                let span = if part.flags.is_transport() {
                    part.transport_size
                } else {
                    part.span()
                };
                running += span;
            }
        }

        for (slot, transport_offset) in transport_cursor {
            let part = self.header.parts[slot];
            let is_transport = part.flags.is_transport();
            let transport_span = if is_transport {
                part.transport_size as usize
            } else {
                part.span() as usize
            };
            let start = transport_offset as usize;
            let end = start + transport_span;
            let transport_bytes = self
                .payload
                .get(start..end)
                .ok_or(Error::Truncated)?;

            // For a TRANSPORT part the algorithm reconstructs exactly
            // `size` installed bytes; padding is appended afterward. A
            // passthrough part's transport bytes already include its
            // padding verbatim.
            let decoded = if is_transport {
                let algorithm_id = self
                    .transport_algorithm_for(part.id, META_TRANSPORT_DECODE)
                    .unwrap_or_else(|| stable_hash(transport::names::NOP));

                let origin_bytes = origin
                    .and_then(|o| o.header.find_part(part.id).map(|p| (o, p)))
                    .and_then(|(o, p)| o.part_bytes(p).ok());

                transport::decode_part(algorithm_id, transport_bytes, part.size, origin_bytes)?
            } else {
                transport_bytes.to_vec()
            };

            debug!(
                "transport decode part {:08x}: {} -> {} bytes",
                part.id,
                transport_span,
                decoded.len()
            );

            output_payload.extend_from_slice(&decoded);
            if is_transport {
                output_payload.resize(output_payload.len() + part.pad_bytes as usize, 0);
            }

            output_header.parts[slot].transport_size = 0;
            let mut flags = output_header.parts[slot].flags;
            flags.set(PartFlags::TRANSPORT, false);
            output_header.parts[slot].flags = flags;
        }

        let mut output = Package {
            header: output_header,
            location: self.location,
            payload: output_payload,
        };
        output.recompute_offsets();
        output.update_hash(false)?;
        Ok(output)
    }
}

/// A small OS-backed random fill, used for Merkle salts. Grounded in the
/// `rand` crate's `rand::rngs::OsRng`/`rand::RngCore` surface rather than
/// a hand-rolled PRNG.
fn getrandom(buf: &mut [u8]) {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(buf);
}

/// Seeks the backing file for `append`-style raw header rewrite, used by
/// the facade's on-disk write path (the in-memory `Package` above treats
/// `write_to` as the only persistence point, matching the original's
/// "closing flushes nothing, callers must explicitly write the header"
/// lifecycle rule).
pub fn header_tail_offset(file_len: u64) -> Result<u64> {
    let header_size = Limits::DEFAULT.header_size as u64;
    file_len.checked_sub(header_size).ok_or(Error::Truncated)
}

#[allow(dead_code)]
fn seek_tail(file: &mut File) -> Result<()> {
    let len = file.metadata().map_err(Error::ReadError)?.len();
    let offset = header_tail_offset(len)?;
    file.seek(SeekFrom::Start(offset)).map_err(Error::SeekError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderLocation;
    use std::io::Write as _;

    fn tmp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn empty_package_round_trip() {
        let pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        let bytes = pkg.to_bytes();
        assert_eq!(bytes.len(), Limits::DEFAULT.header_size);

        let reopened = Package::from_bytes(&bytes).unwrap();
        assert_eq!(reopened.header().iterate_parts().count(), 0);
    }

    #[test]
    fn add_file_then_reopen() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        let data = vec![0x42u8; 5000];
        let id = pkg.add_file_from_bytes(&data, "kernel", PartFlags::default()).unwrap();
        pkg.update_hash(false).unwrap();

        let part = *pkg.header().find_part(id).unwrap();
        assert_eq!(part.size, 5000);
        assert_eq!(part.pad_bytes, 8);
        assert_eq!(part.offset, Limits::DEFAULT.header_size as u64);

        let bytes = pkg.to_bytes();
        let reopened = Package::from_bytes(&bytes).unwrap();
        let reopened_part = reopened.header().find_part(id).unwrap();
        let stored = reopened.part_bytes(reopened_part).unwrap();
        assert_eq!(&stored[..5000], &data[..]);
    }

    #[test]
    fn excluded_part_does_not_change_payload_hash() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        pkg.update_hash(false).unwrap();
        let hash_before = pkg.header().payload_hash;

        let mut flags = PartFlags::default();
        flags.set(PartFlags::EXCLUDE_FROM_HASH, true);
        pkg.add_file_from_bytes(&[0xFFu8; 64], "signature-block", flags)
            .unwrap();
        pkg.update_hash(false).unwrap();

        assert_eq!(pkg.header().payload_hash, hash_before);
    }

    #[test]
    fn corruption_is_detected_by_update_hash() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        pkg.add_file_from_bytes(&[1, 2, 3, 4], "kernel", PartFlags::default())
            .unwrap();
        pkg.update_hash(false).unwrap();
        let original_hash = pkg.header().payload_hash;

        pkg.payload[0] ^= 0xFF;
        pkg.update_hash(false).unwrap();
        assert_ne!(pkg.header().payload_hash, original_hash);
    }

    #[test]
    fn sign_then_header_hash_ignores_signature() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        pkg.update_hash(false).unwrap();
        let hash_a = pkg.update_hash(true).unwrap().unwrap();

        pkg.sign(&[0xAAu8; 64]).unwrap();
        let hash_b = pkg.update_hash(true).unwrap().unwrap();

        assert_eq!(hash_a.as_bytes(), hash_b.as_bytes());
    }

    #[test]
    fn transport_round_trip_with_nop() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        let data = vec![7u8; 1000];
        let id = pkg.add_file_from_bytes(&data, "rootfs", PartFlags::default()).unwrap();
        pkg.set_transport_algorithm(id, "nop", "nop").unwrap();
        pkg.update_hash(false).unwrap();

        let encoded = pkg.transport_encode(None).unwrap();
        let decoded = encoded.transport_decode(None).unwrap();

        let part = decoded.header().find_part(id).unwrap();
        assert_eq!(decoded.part_bytes(part).unwrap()[..1000], data[..]);
    }

    #[test]
    fn transport_round_trip_with_origin_delta() {
        let mut origin = Package::create(HashKind::Sha256, HeaderLocation::First);
        let origin_data = vec![0xABu8; 64 * 1024];
        let origin_id = origin
            .add_file_from_bytes(&origin_data, "rootfs", PartFlags::default())
            .unwrap();
        origin.update_hash(false).unwrap();

        let mut input = Package::create(HashKind::Sha256, HeaderLocation::First);
        let mut input_data = origin_data.clone();
        input_data[42] = 0xFF;
        let input_id = input
            .add_file_from_bytes(&input_data, "rootfs", PartFlags::default())
            .unwrap();
        assert_eq!(origin_id, input_id);
        input
            .set_transport_algorithm(input_id, "bsdiff-delta", "bsdiff-delta")
            .unwrap();
        input.update_hash(false).unwrap();

        let encoded = input.transport_encode(Some(&origin)).unwrap();
        let encoded_part = encoded.header().find_part(input_id).unwrap();
        assert!(encoded_part.transport_size < input_data.len() as u64);

        let decoded = encoded.transport_decode(Some(&origin)).unwrap();
        let decoded_part = decoded.header().find_part(input_id).unwrap();
        assert_eq!(decoded.part_bytes(decoded_part).unwrap()[..input_data.len()], input_data[..]);
    }

    #[test]
    fn merkle_tree_sibling_part_is_added() {
        let mut pkg = Package::create(HashKind::Sha256, HeaderLocation::First);
        let data = vec![0x5Au8; 200_000];
        let f = tmp_file(&data);
        let id = pkg
            .add_file_with_merkle_tree(f.path(), "kernel", PartFlags::default())
            .unwrap();
        pkg.update_hash(false).unwrap();

        let tree_id = stable_hash("kernel-hash-tree");
        let tree_part = pkg.header().find_part(tree_id).unwrap();
        assert_eq!(tree_part.size, crate::merkle::tree_size(data.len() as u64));

        let salt_entry = pkg
            .header()
            .iterate_meta(stable_hash(META_MERKLE_SALT), Some(id))
            .next()
            .unwrap();
        assert_eq!(salt_entry.size, 32);
    }
}
