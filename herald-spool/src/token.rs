use sha2::{Digest, Sha256};

/// Identifier shared by the two files of one queue entry
///
/// Tokens are ULIDs: they sort by creation time, which gives the queue its
/// FIFO order, and carry enough randomness that two runners enqueueing into
/// the same directory never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueToken {
    id: ulid::Ulid,
}

impl QueueToken {
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Parse a token from a bare file stem.
    ///
    /// Anything that could step outside the queue directory is rejected
    /// before the ULID itself is checked.
    pub fn parse(stem: &str) -> Option<Self> {
        if stem.contains('/') || stem.contains('\\') || stem.contains("..") {
            return None;
        }

        ulid::Ulid::from_string(stem).ok().map(Self::new)
    }

    /// Parse a token from a committed entry's file name, `<token>.eml` or
    /// `<token>.json`
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename
            .strip_suffix(".json")
            .or_else(|| filename.strip_suffix(".eml"))?;

        Self::parse(stem)
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }

    /// The hash slice this token belongs to when a queue is split `slices`
    /// ways. The hash only depends on the token's text, so every runner
    /// agrees on it.
    #[must_use]
    pub fn slice(&self, slices: u32) -> u32 {
        if slices <= 1 {
            return 0;
        }

        let digest = Sha256::digest(self.id.to_string().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);

        let bucket = u64::from_be_bytes(prefix) % u64::from(slices);
        u32::try_from(bucket).unwrap_or_default()
    }
}

impl std::fmt::Display for QueueToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::str::FromStr for QueueToken {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}
