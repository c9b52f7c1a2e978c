//! Registry of RTP header extensions in the one-byte form of RFC 5285.

use crate::error::{Error, Result};

/// Header extensions recognized by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    /// Transmission time offset, RFC 5450. Signed 24-bit, 90 kHz timescale.
    TransmissionTimeOffset,
    /// Client-to-mixer audio level, RFC 6464. Voice bit plus 7-bit dBov.
    AudioLevel,
    /// Absolute send time: 24-bit seconds with 18 fractional bits.
    AbsoluteSendTime,
}

impl ExtensionKind {
    /// Encoded TLV length in bytes, including the `(id, len)` byte and any
    /// trailing pad bytes. All current kinds pack to one word.
    pub const fn block_length(self) -> usize {
        match self {
            // (id|len) byte + 24-bit value
            ExtensionKind::TransmissionTimeOffset => 4,
            // (id|len) byte + level byte + 2 pad bytes
            ExtensionKind::AudioLevel => 4,
            // (id|len) byte + 24-bit value
            ExtensionKind::AbsoluteSendTime => 4,
        }
    }

    /// The `len` field of the TLV: payload bytes minus one, pad excluded.
    pub(crate) const fn encoded_len_field(self) -> u8 {
        match self {
            ExtensionKind::TransmissionTimeOffset => 2,
            ExtensionKind::AudioLevel => 0,
            ExtensionKind::AbsoluteSendTime => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: ExtensionKind,
    id: u8,
}

/// Ordered registry of header extensions.
///
/// Iteration order is registration order; block offsets are derived from it,
/// so they stay stable for the lifetime of a registration. At most 14
/// extensions exist (ids 1..=14), so a plain vector is the index.
#[derive(Debug, Default, Clone)]
pub struct ExtensionMap {
    entries: Vec<Entry>,
}

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kind` under the given one-byte-form id. Re-registering a
    /// kind updates its id in place without changing its position.
    pub fn register(&mut self, kind: ExtensionKind, id: u8) -> Result<()> {
        if !(1..=14).contains(&id) {
            return Err(Error::ErrInvalidExtensionId);
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.kind == kind) {
            entry.id = id;
            return Ok(());
        }
        self.entries.push(Entry { kind, id });
        Ok(())
    }

    pub fn deregister(&mut self, kind: ExtensionKind) {
        self.entries.retain(|e| e.kind != kind);
    }

    pub fn is_registered(&self, kind: ExtensionKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn id_of(&self, kind: ExtensionKind) -> Option<u8> {
        self.entries.iter().find(|e| e.kind == kind).map(|e| e.id)
    }

    /// Byte offset of this extension's TLV within the extension block
    /// payload (i.e. not counting the 4-byte block header): the sum of the
    /// encoded lengths of all extensions registered before it.
    pub fn block_start_offset(&self, kind: ExtensionKind) -> Option<usize> {
        let mut offset = 0;
        for entry in &self.entries {
            if entry.kind == kind {
                return Some(offset);
            }
            offset += entry.kind.block_length();
        }
        None
    }

    /// Registered `(kind, id)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ExtensionKind, u8)> + '_ {
        self.entries.iter().map(|e| (e.kind, e.id))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes the extension block adds to a header: the 4-byte block
    /// header plus all TLVs, or 0 when nothing is registered.
    pub fn total_length_in_bytes(&self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        4 + self
            .entries
            .iter()
            .map(|e| e.kind.block_length())
            .sum::<usize>()
    }
}
