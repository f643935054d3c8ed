//! Hash engine: payload hash and header hash, polymorphic over
//! `{SHA256, SHA384, SHA512}` via a tagged enum dispatching into the `sha2`
//! crate rather than a trait object, so each digest is a small
//! stack-allocated value instead of a heap `Vec`.

use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};
use crate::header::Header;
use crate::limits::HashKind;

/// A computed digest. The active variant matches the `HashKind` that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Sha256([u8; 32]),
    Sha384([u8; 48]),
    Sha512([u8; 64]),
}

impl Digest {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Digest::Sha256(b) => &b[..],
            Digest::Sha384(b) => &b[..],
            Digest::Sha512(b) => &b[..],
        }
    }

    pub fn kind(&self) -> HashKind {
        match self {
            Digest::Sha256(_) => HashKind::Sha256,
            Digest::Sha384(_) => HashKind::Sha384,
            Digest::Sha512(_) => HashKind::Sha512,
        }
    }
}

/// Streaming digest accumulator, one variant per supported `HashKind`.
enum Engine {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Engine {
    fn new(kind: HashKind) -> Engine {
        match kind {
            HashKind::Sha256 => Engine::Sha256(Sha256::new()),
            HashKind::Sha384 => Engine::Sha384(Sha384::new()),
            HashKind::Sha512 => Engine::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Engine::Sha256(h) => h.update(data),
            Engine::Sha384(h) => h.update(data),
            Engine::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Engine::Sha256(h) => Digest::Sha256(h.finalize().into()),
            Engine::Sha384(h) => Digest::Sha384(h.finalize().into()),
            Engine::Sha512(h) => Digest::Sha512(h.finalize().into()),
        }
    }
}

/// Digest the concatenation of part bytes, as they appear in `reader`, in
/// directory order, skipping any part whose `EXCLUDE_FROM_HASH` flag is
/// set. `reader` yields the exact on-disk bytes (including padding) for a
/// given part's `(offset, span)`.
///
/// `transport_form` selects which span a `TRANSPORT`-flagged part occupies
/// on disk: its installed `span()` (size + padding) when false, or its
/// encoded `transport_size` when true.
pub fn payload_hash<F>(header: &Header, transport_form: bool, mut read_part: F) -> Result<Digest>
where
    F: FnMut(u64, u64) -> Result<Vec<u8>>,
{
    let mut engine = Engine::new(header.hash_kind);
    for part in header.iterate_parts() {
        if part.flags.is_excluded_from_hash() {
            continue;
        }
        let span = if transport_form && part.flags.is_transport() {
            part.transport_size
        } else {
            part.span()
        };
        let bytes = read_part(part.offset, span)?;
        if bytes.len() as u64 != span {
            return Err(Error::Truncated);
        }
        engine.update(&bytes);
    }
    Ok(engine.finalize())
}

/// Digest the header bytes with the signature field zeroed: save the
/// current signature and length, zero them, digest, then the caller is
/// expected to have already restored `header` (this function takes a
/// snapshot, it does not mutate `header`).
pub fn header_hash(header: &Header) -> Result<Digest> {
    let mut clone = header.clone();
    clone.signature = [0u8; crate::limits::SIGNATURE_MAX];
    clone.signature_sz = 0;

    let bytes = clone.to_bytes();
    let mut engine = Engine::new(header.hash_kind);
    engine.update(&bytes);
    Ok(engine.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::PartFlags;

    #[test]
    fn payload_hash_of_empty_archive_is_empty_digest() {
        let header = Header::new(HashKind::Sha256);
        let digest = payload_hash(&header, false, |_, _| Ok(Vec::new())).unwrap();
        let expected = Sha256::new().finalize();
        assert_eq!(digest.as_bytes(), &expected[..]);
    }

    #[test]
    fn excluded_part_does_not_affect_payload_hash() {
        let mut header = Header::new(HashKind::Sha256);
        let id = crate::id::stable_hash("signature-block");
        let slot = header
            .add_part(id, crate::header::HeaderLocation::First)
            .unwrap();
        let mut flags = PartFlags::default();
        flags.set(PartFlags::EXCLUDE_FROM_HASH, true);
        header.set_part_geometry(slot, 16, flags);

        let digest =
            payload_hash(&header, false, |_, span| Ok(vec![0xAAu8; span as usize])).unwrap();
        let empty = Sha256::new().finalize();
        assert_eq!(digest.as_bytes(), &empty[..]);
    }

    #[test]
    fn header_hash_ignores_signature_field() {
        let mut a = Header::new(HashKind::Sha256);
        let mut b = Header::new(HashKind::Sha256);
        a.signature[0] = 0xAA;
        a.signature_sz = 1;
        b.signature[0] = 0xBB;
        b.signature_sz = 1;

        assert_eq!(
            header_hash(&a).unwrap().as_bytes(),
            header_hash(&b).unwrap().as_bytes()
        );
    }
}
