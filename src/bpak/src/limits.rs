/// Compile-time capacity constants that make the header a fixed 4096-byte
/// structure. These are part of the on-disk format, not implementation
/// details: independent producers/consumers must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub header_size: usize,
    pub align: u64,
    pub max_parts: usize,
    pub max_meta: usize,
    pub meta_blob_size: usize,
}

impl Limits {
    pub const DEFAULT: Limits = Limits {
        header_size: 4096,
        align: 16,
        max_parts: 32,
        max_meta: 32,
        meta_blob_size: 2048,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Limits::DEFAULT
    }
}

pub const MAGIC: u32 = 0x4b41_5042; // "BPAK" little-endian
pub const VERSION: u16 = 2;
pub const SIGNATURE_MAX: usize = 512;

/// Digest kind carried in the header. The width of each variant is known
/// statically, so the hash engine returns a small stack-allocated `Digest`
/// rather than a heap `Vec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    pub fn size(self) -> usize {
        match self {
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }

    pub fn from_u8(v: u8) -> Option<HashKind> {
        match v {
            0 => Some(HashKind::Sha256),
            1 => Some(HashKind::Sha384),
            2 => Some(HashKind::Sha512),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            HashKind::Sha256 => 0,
            HashKind::Sha384 => 1,
            HashKind::Sha512 => 2,
        }
    }
}

/// Signing-primitive identifier. Opaque beyond its tag: the crate never
/// inspects key material or performs signing/verification itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    None,
    Prime256v1,
    Secp384r1,
    Secp521r1,
    Ed25519,
}

impl SignatureKind {
    pub fn from_u8(v: u8) -> Option<SignatureKind> {
        match v {
            0 => Some(SignatureKind::None),
            1 => Some(SignatureKind::Prime256v1),
            2 => Some(SignatureKind::Secp384r1),
            3 => Some(SignatureKind::Secp521r1),
            4 => Some(SignatureKind::Ed25519),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SignatureKind::None => 0,
            SignatureKind::Prime256v1 => 1,
            SignatureKind::Secp384r1 => 2,
            SignatureKind::Secp521r1 => 3,
            SignatureKind::Ed25519 => 4,
        }
    }
}

/// Part directory flags. Unknown bits must round-trip unchanged, so the
/// wrapper keeps the raw value alongside the named accessors rather than
/// parsing it into an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartFlags(pub u8);

impl PartFlags {
    pub const TRANSPORT: u8 = 1 << 0;
    pub const EXCLUDE_FROM_HASH: u8 = 1 << 1;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn is_transport(self) -> bool {
        self.contains(Self::TRANSPORT)
    }

    pub fn is_excluded_from_hash(self) -> bool {
        self.contains(Self::EXCLUDE_FROM_HASH)
    }
}
