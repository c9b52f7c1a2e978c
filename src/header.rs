//! RTP wire codec: fixed header, CSRC list and the one-byte header-extension
//! block of RFC 5285, plus in-place updates of individual extension fields on
//! already-serialized packets.
//!
//! The in-place updaters deliberately never fail: the send boundary stamps
//! transmission-time-offset and absolute-send-time on every outgoing packet
//! without checking what is registered, and an unregistered or malformed
//! extension is a logged no-op.

use bytes::{BufMut, BytesMut};
use log::warn;
use rand::Rng;

use crate::error::{Error, Result};
use crate::extension::{ExtensionKind, ExtensionMap};

/// Fixed RTP header length, before CSRCs and extensions.
pub const RTP_FIXED_HEADER_LENGTH: usize = 12;
/// An RTP packet carries at most 15 contributing sources.
pub const MAX_CSRCS: usize = 15;

const RTP_VERSION: u8 = 2;
const MARKER_BIT_MASK: u8 = 0x80;
const PADDING_BIT_MASK: u8 = 0x20;
const EXTENSION_BIT_MASK: u8 = 0x10;
/// "defined by profile" magic of the one-byte extension form.
const ONE_BYTE_EXTENSION_MAGIC: u16 = 0xBEDE;

/// Extension values written into the block at build time. The time-sensitive
/// ones are overwritten in place at the send boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionValues {
    pub transmission_time_offset: i32,
    pub absolute_send_time: u32,
    pub voice_activity: bool,
    pub audio_level_dbov: u8,
}

/// Fields recovered from a serialized packet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    /// Total header length: fixed part, CSRCs and extension block.
    pub header_length: usize,
    /// Value of the last byte when the padding bit is set, 0 otherwise.
    pub padding_length: usize,
}

impl ParsedHeader {
    pub fn csrc_count(&self) -> usize {
        self.csrcs.len()
    }
}

fn put_u24(buf: &mut [u8], value: u32) {
    buf[0] = (value >> 16) as u8;
    buf[1] = (value >> 8) as u8;
    buf[2] = value as u8;
}

/// Serializes a complete RTP header into `buf` and returns its length.
///
/// The extension bit is set only when the extension block came out non-empty.
/// The only failure is a CSRC list longer than 15 entries.
pub fn build_rtp_header(
    buf: &mut BytesMut,
    payload_type: i8,
    ssrc: u32,
    marker: bool,
    timestamp: u32,
    sequence_number: u16,
    csrcs: &[u32],
    extensions: &ExtensionMap,
    values: &ExtensionValues,
) -> Result<usize> {
    if csrcs.len() > MAX_CSRCS {
        debug_assert!(false, "CSRC list too long");
        return Err(Error::ErrTooManyCsrcs);
    }
    let start = buf.len();
    buf.put_u8((RTP_VERSION << 6) | csrcs.len() as u8);
    buf.put_u8((payload_type as u8 & 0x7F) | if marker { MARKER_BIT_MASK } else { 0 });
    buf.put_u16(sequence_number);
    buf.put_u32(timestamp);
    buf.put_u32(ssrc);
    for csrc in csrcs {
        buf.put_u32(*csrc);
    }

    let extension_length = build_extension_block(buf, extensions, values);
    if extension_length > 0 {
        buf[start] |= EXTENSION_BIT_MASK;
    }
    Ok(buf.len() - start)
}

/// Appends the one-byte-form extension block for every registered extension,
/// in registration order. Returns the number of bytes appended; 0 when no
/// extension is registered (nothing is written in that case).
pub fn build_extension_block(
    buf: &mut BytesMut,
    extensions: &ExtensionMap,
    values: &ExtensionValues,
) -> usize {
    if extensions.is_empty() {
        return 0;
    }
    let start = buf.len();
    buf.put_u16(ONE_BYTE_EXTENSION_MAGIC);
    buf.put_u16(0); // patched below

    let mut block_length = 0usize;
    for (kind, id) in extensions.iter() {
        let tlv = buf.len();
        buf.put_u8((id << 4) | kind.encoded_len_field());
        match kind {
            ExtensionKind::TransmissionTimeOffset => {
                buf.put_slice(&[0; 3]);
                put_u24(&mut buf[tlv + 1..], values.transmission_time_offset as u32);
            }
            ExtensionKind::AudioLevel => {
                buf.put_u8(
                    if values.voice_activity { 0x80 } else { 0 } | (values.audio_level_dbov & 0x7F),
                );
                buf.put_slice(&[0; 2]); // pad to a word boundary
            }
            ExtensionKind::AbsoluteSendTime => {
                buf.put_slice(&[0; 3]);
                put_u24(&mut buf[tlv + 1..], values.absolute_send_time & 0x00FF_FFFF);
            }
        }
        block_length += kind.block_length();
    }
    if block_length == 0 {
        buf.truncate(start);
        return 0;
    }
    debug_assert_eq!(block_length % 4, 0);
    let words = (block_length / 4) as u16;
    buf[start + 2] = (words >> 8) as u8;
    buf[start + 3] = words as u8;
    buf.len() - start
}

/// Parses the header of a serialized packet.
pub fn parse(packet: &[u8]) -> Result<ParsedHeader> {
    if packet.len() < RTP_FIXED_HEADER_LENGTH {
        return Err(Error::ErrPacketTooShort);
    }
    let version = packet[0] >> 6;
    if version != RTP_VERSION {
        return Err(Error::ErrMalformedPacket);
    }
    let padding = packet[0] & PADDING_BIT_MASK != 0;
    let extension = packet[0] & EXTENSION_BIT_MASK != 0;
    let csrc_count = (packet[0] & 0x0F) as usize;

    let mut header_length = RTP_FIXED_HEADER_LENGTH + 4 * csrc_count;
    if packet.len() < header_length {
        return Err(Error::ErrPacketTooShort);
    }
    let mut csrcs = Vec::with_capacity(csrc_count);
    for i in 0..csrc_count {
        let at = RTP_FIXED_HEADER_LENGTH + 4 * i;
        csrcs.push(u32::from_be_bytes([
            packet[at],
            packet[at + 1],
            packet[at + 2],
            packet[at + 3],
        ]));
    }

    if extension {
        if packet.len() < header_length + 4 {
            return Err(Error::ErrPacketTooShort);
        }
        let words =
            u16::from_be_bytes([packet[header_length + 2], packet[header_length + 3]]) as usize;
        header_length += 4 + 4 * words;
        if packet.len() < header_length {
            return Err(Error::ErrPacketTooShort);
        }
    }

    let padding_length = if padding {
        packet[packet.len() - 1] as usize
    } else {
        0
    };

    Ok(ParsedHeader {
        version,
        padding,
        extension,
        marker: packet[1] & MARKER_BIT_MASK != 0,
        payload_type: packet[1] & 0x7F,
        sequence_number: u16::from_be_bytes([packet[2], packet[3]]),
        timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
        ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        csrcs,
        header_length,
        padding_length,
    })
}

/// Locates `kind`'s TLV in a serialized packet, verifying the extension
/// magic, the declared header length and the `(id << 4) | len` marker byte.
/// Any failed check makes the caller a no-op.
fn find_extension_block(
    packet: &[u8],
    header: &ParsedHeader,
    extensions: &ExtensionMap,
    kind: ExtensionKind,
) -> Option<usize> {
    let id = extensions.id_of(kind)?;
    let block_offset = extensions.block_start_offset(kind)?;

    let magic_pos = RTP_FIXED_HEADER_LENGTH + 4 * header.csrc_count();
    // 4-byte block header between the magic and the first TLV.
    let block_pos = magic_pos + 4 + block_offset;
    if packet.len() < block_pos + kind.block_length()
        || header.header_length < block_pos + kind.block_length()
    {
        warn!("failed to update header extension, invalid length");
        return None;
    }
    if packet[magic_pos] != 0xBE || packet[magic_pos + 1] != 0xDE {
        warn!("failed to update header extension, extension block not found");
        return None;
    }
    let first_block_byte = (id << 4) | kind.encoded_len_field();
    if packet[block_pos] != first_block_byte {
        warn!("failed to update header extension, block mismatch");
        return None;
    }
    Some(block_pos)
}

/// Rewrites the transmission-time-offset extension in place, converting the
/// millisecond delta to the 90 kHz timescale. No-op if the extension is not
/// registered or the packet fails verification.
pub fn update_transmission_time_offset(
    packet: &mut [u8],
    header: &ParsedHeader,
    extensions: &ExtensionMap,
    time_diff_ms: i64,
) {
    if !extensions.is_registered(ExtensionKind::TransmissionTimeOffset) {
        return;
    }
    let Some(block_pos) = find_extension_block(
        packet,
        header,
        extensions,
        ExtensionKind::TransmissionTimeOffset,
    ) else {
        return;
    };
    put_u24(&mut packet[block_pos + 1..], (time_diff_ms * 90) as u32);
}

/// Rewrites the absolute-send-time extension in place: `now_ms` as 24-bit
/// seconds with 18 fractional bits. No-op on verification failure.
pub fn update_absolute_send_time(
    packet: &mut [u8],
    header: &ParsedHeader,
    extensions: &ExtensionMap,
    now_ms: i64,
) {
    if !extensions.is_registered(ExtensionKind::AbsoluteSendTime) {
        return;
    }
    let Some(block_pos) =
        find_extension_block(packet, header, extensions, ExtensionKind::AbsoluteSendTime)
    else {
        return;
    };
    put_u24(
        &mut packet[block_pos + 1..],
        (((now_ms << 18) / 1000) & 0x00FF_FFFF) as u32,
    );
}

/// Rewrites the audio-level extension in place. Returns whether the level
/// was written.
pub fn update_audio_level(
    packet: &mut [u8],
    header: &ParsedHeader,
    extensions: &ExtensionMap,
    voice_activity: bool,
    dbov: u8,
) -> bool {
    let Some(block_pos) = find_extension_block(packet, header, extensions, ExtensionKind::AudioLevel)
    else {
        return false;
    };
    packet[block_pos + 1] = if voice_activity { 0x80 } else { 0 } | (dbov & 0x7F);
    true
}

/// Appends a padding run to a serialized packet: sets the padding bit, fills
/// the run with random bytes and writes the run length into the final byte
/// as RFC 3550 requires.
pub fn append_padding(packet: &mut BytesMut, padding_length: usize) {
    debug_assert!((1..=255).contains(&padding_length));
    packet[0] |= PADDING_BIT_MASK;
    let mut rng = rand::rng();
    for _ in 0..padding_length - 1 {
        packet.put_u8(rng.random());
    }
    packet.put_u8(padding_length as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_extensions() -> (ExtensionMap, ExtensionValues) {
        (ExtensionMap::new(), ExtensionValues::default())
    }

    #[test]
    fn test_minimal_header_bytes() {
        let (map, values) = no_extensions();
        let mut buf = BytesMut::new();
        let len = build_rtp_header(
            &mut buf,
            96,
            0xAABBCCDD,
            false,
            0x11223344,
            0x1234,
            &[],
            &map,
            &values,
        )
        .unwrap();

        assert_eq!(len, 12);
        assert_eq!(
            &buf[..],
            &[0x80, 0x60, 0x12, 0x34, 0x11, 0x22, 0x33, 0x44, 0xAA, 0xBB, 0xCC, 0xDD]
        );
    }

    #[test]
    fn test_header_round_trip() {
        let (map, values) = no_extensions();
        let mut buf = BytesMut::new();
        build_rtp_header(
            &mut buf,
            111,
            0xDEADBEEF,
            true,
            90_000,
            65_535,
            &[1, 2, 3],
            &map,
            &values,
        )
        .unwrap();

        let header = parse(&buf).unwrap();
        assert_eq!(header.version, 2);
        assert!(header.marker);
        assert_eq!(header.payload_type, 111);
        assert_eq!(header.sequence_number, 65_535);
        assert_eq!(header.timestamp, 90_000);
        assert_eq!(header.ssrc, 0xDEADBEEF);
        assert_eq!(header.csrcs, vec![1, 2, 3]);
        assert_eq!(header.header_length, 12 + 12);
        assert!(!header.extension);
    }

    #[test]
    fn test_too_many_csrcs() {
        let (map, values) = no_extensions();
        let csrcs = vec![7u32; 16];
        let mut buf = BytesMut::new();
        assert_eq!(
            build_rtp_header(&mut buf, 96, 1, false, 0, 0, &csrcs, &map, &values),
            Err(Error::ErrTooManyCsrcs)
        );
    }

    #[test]
    fn test_absolute_send_time_block_bytes() {
        let mut map = ExtensionMap::new();
        map.register(ExtensionKind::AbsoluteSendTime, 3).unwrap();
        let now_ms: i64 = 1_000_000;
        let values = ExtensionValues {
            absolute_send_time: (((now_ms << 18) / 1000) & 0x00FF_FFFF) as u32,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        let len = build_rtp_header(&mut buf, 96, 1, false, 0, 0, &[], &map, &values).unwrap();

        assert_eq!(len, 12 + 8);
        assert_eq!(buf[0] & 0x10, 0x10);
        assert_eq!(&buf[12..16], &[0xBE, 0xDE, 0x00, 0x01]);
        assert_eq!(buf[16], (3 << 4) | 2);
        let expected = (((now_ms << 18) / 1000) & 0x00FF_FFFF) as u32;
        let got = u32::from_be_bytes([0, buf[17], buf[18], buf[19]]);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_extension_block_registration_order() {
        let mut map = ExtensionMap::new();
        map.register(ExtensionKind::TransmissionTimeOffset, 5).unwrap();
        map.register(ExtensionKind::AudioLevel, 6).unwrap();
        let values = ExtensionValues {
            transmission_time_offset: -900,
            voice_activity: true,
            audio_level_dbov: 30,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        build_rtp_header(&mut buf, 0, 1, false, 0, 0, &[], &map, &values).unwrap();

        // length = 2 words
        assert_eq!(&buf[12..16], &[0xBE, 0xDE, 0x00, 0x02]);
        assert_eq!(buf[16], (5 << 4) | 2);
        // -900 * 1 as 24-bit two's complement
        assert_eq!(&buf[17..20], &[0xFF, 0xFC, 0x7C]);
        assert_eq!(buf[20], 6 << 4);
        assert_eq!(buf[21], 0x80 | 30);
        assert_eq!(&buf[22..24], &[0, 0]);
    }

    #[test]
    fn test_update_transmission_time_offset_in_place() {
        let mut map = ExtensionMap::new();
        map.register(ExtensionKind::TransmissionTimeOffset, 2).unwrap();
        let values = ExtensionValues::default();

        let mut buf = BytesMut::new();
        build_rtp_header(&mut buf, 96, 1, false, 0, 0, &[], &map, &values).unwrap();
        let header = parse(&buf).unwrap();

        update_transmission_time_offset(&mut buf, &header, &map, 10);
        assert_eq!(buf[16], (2 << 4) | 2);
        assert_eq!(&buf[17..20], &[0x00, 0x03, 0x84]); // 900

        // Idempotent: writing the same value twice changes nothing.
        let snapshot = buf.clone();
        update_transmission_time_offset(&mut buf, &header, &map, 10);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_update_unregistered_extension_is_noop() {
        let (map, values) = no_extensions();
        let mut buf = BytesMut::new();
        build_rtp_header(&mut buf, 96, 1, false, 0, 0, &[], &map, &values).unwrap();
        let header = parse(&buf).unwrap();

        let snapshot = buf.clone();
        update_transmission_time_offset(&mut buf, &header, &map, 1000);
        update_absolute_send_time(&mut buf, &header, &map, 1000);
        assert!(!update_audio_level(&mut buf, &header, &map, true, 10));
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_update_rejects_foreign_block() {
        // Packet built with one registry, update attempted with another whose
        // id differs: the (id|len) check must refuse the write.
        let mut built_with = ExtensionMap::new();
        built_with
            .register(ExtensionKind::AbsoluteSendTime, 3)
            .unwrap();
        let mut buf = BytesMut::new();
        build_rtp_header(
            &mut buf,
            96,
            1,
            false,
            0,
            0,
            &[],
            &built_with,
            &ExtensionValues::default(),
        )
        .unwrap();
        let header = parse(&buf).unwrap();

        let mut other = ExtensionMap::new();
        other.register(ExtensionKind::AbsoluteSendTime, 4).unwrap();
        let snapshot = buf.clone();
        update_absolute_send_time(&mut buf, &header, &other, 123_456);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_update_audio_level() {
        let mut map = ExtensionMap::new();
        map.register(ExtensionKind::AudioLevel, 1).unwrap();
        let mut buf = BytesMut::new();
        build_rtp_header(
            &mut buf,
            96,
            1,
            false,
            0,
            0,
            &[],
            &map,
            &ExtensionValues::default(),
        )
        .unwrap();
        let header = parse(&buf).unwrap();

        assert!(update_audio_level(&mut buf, &header, &map, true, 127));
        assert_eq!(buf[17], 0xFF);
        assert!(update_audio_level(&mut buf, &header, &map, false, 5));
        assert_eq!(buf[17], 0x05);
    }

    #[test]
    fn test_append_padding() {
        let (map, values) = no_extensions();
        let mut buf = BytesMut::new();
        build_rtp_header(&mut buf, 96, 1, false, 0, 0, &[], &map, &values).unwrap();
        append_padding(&mut buf, 224);

        assert_eq!(buf.len(), 12 + 224);
        assert_eq!(buf[0] & 0x20, 0x20);
        assert_eq!(buf[buf.len() - 1], 224);

        let header = parse(&buf).unwrap();
        assert!(header.padding);
        assert_eq!(header.padding_length, 224);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse(&[0x80, 0x60]), Err(Error::ErrPacketTooShort));
        let not_rtp = [0u8; 12];
        assert_eq!(parse(&not_rtp), Err(Error::ErrMalformedPacket));
    }
}
