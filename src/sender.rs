//! The RTP sender core: sequence/timestamp assignment, packet construction,
//! pacer and transport dispatch, NACK response, RTX wrapping and padding.
//!
//! Two independent locks guard the state: `send` covers everything the
//! packet-building path touches, `stats` covers counters and the delay
//! window. They are never held at the same time; paths needing both snapshot
//! under `send` first. The target bitrate sits behind its own lock because
//! the NACK path reads it while `send` is already held.

use bytes::BytesMut;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::audio::AudioSender;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::extension::{ExtensionKind, ExtensionMap};
use crate::header::{self, ExtensionValues};
use crate::history::{PacketHistory, StorageKind};
use crate::lock;
use crate::nack::NackRateLimiter;
use crate::observer::{
    BitrateObserver, FrameCountObserver, SendSideDelayObserver, StreamDataCountersObserver,
};
use crate::pacer::{Pacer, PacketPriority};
use crate::payload::{
    FragmentationHeader, FrameType, PayloadKind, PayloadRegistry, VideoCodec,
    VIDEO_PAYLOAD_TYPE_FREQUENCY,
};
use crate::ssrc::SsrcRegistry;
use crate::stats::{Bitrate, SendDelayWindow, StreamDataCounters};
use crate::transport::Transport;
use crate::video::{FecProtectionParams, VideoSender};
use crate::{IP_PACKET_SIZE, MAX_PADDING_LENGTH};

/// RTX disabled.
pub const RTX_OFF: u8 = 0x00;
/// Retransmissions are wrapped per RFC 4588 on the RTX stream.
pub const RTX_RETRANSMITTED: u8 = 0x01;
/// Padding requests are repaid with stored payloads on the RTX stream.
pub const RTX_REDUNDANT_PAYLOADS: u8 = 0x02;

/// Random sequence numbers start in 1..=0x7FFF.
const MAX_INIT_RTP_SEQ_NUMBER: u16 = 0x7FFF;
/// IPv4 + UDP header bytes assumed for the default payload budget.
const UDP_IP_OVERHEAD: usize = 28;

fn random_sequence_number() -> u16 {
    use rand::Rng;
    rand::rng().random_range(1..=MAX_INIT_RTP_SEQ_NUMBER)
}

/// Checkpoint of a sender's sequence space, so an outer controller can tear
/// a sender down and restore it without breaking the receive side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpState {
    pub sequence_number: u16,
    pub start_timestamp: u32,
    pub timestamp: u32,
    pub capture_time_ms: i64,
    pub last_timestamp_time_ms: i64,
    pub media_has_been_sent: bool,
}

/// One packet a packetizer wants on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PacketPlan {
    pub payload: Vec<u8>,
    pub marker: bool,
    pub priority: PacketPriority,
    pub storage: StorageKind,
}

/// Closed dispatch over the two media modes; a sender holds exactly one.
enum MediaSender {
    Audio(AudioSender),
    Video(VideoSender),
}

struct SendState {
    sending_media: bool,
    max_payload_length: usize,
    packet_over_head: u16,
    payload_type: i8,
    payload_registry: PayloadRegistry,
    extensions: ExtensionMap,
    transmission_time_offset: i32,
    absolute_send_time: u32,
    start_timestamp_forced: bool,
    start_timestamp: u32,
    sequence_number_forced: bool,
    sequence_number: u16,
    sequence_number_rtx: u16,
    ssrc_forced: bool,
    ssrc: u32,
    ssrc_rtx: u32,
    timestamp: u32,
    capture_time_ms: i64,
    last_timestamp_time_ms: i64,
    media_has_been_sent: bool,
    last_packet_marker_bit: bool,
    csrcs: Vec<u32>,
    include_csrcs: bool,
    rtx_mode: u8,
    payload_type_rtx: i8,
    nack_limiter: NackRateLimiter,
    media: MediaSender,
}

impl SendState {
    fn rtp_header_length(&self) -> usize {
        let mut length = header::RTP_FIXED_HEADER_LENGTH;
        if self.include_csrcs {
            length += 4 * self.csrcs.len();
        }
        length + self.extensions.total_length_in_bytes()
    }

    fn max_data_payload_length(&self) -> usize {
        let mut length = self.max_payload_length.saturating_sub(self.rtp_header_length());
        if let MediaSender::Video(video) = &self.media {
            length = length.saturating_sub(video.fec_packet_overhead());
            if self.rtx_mode != RTX_OFF {
                // RTX retransmissions grow by the 2-byte OSN.
                length = length.saturating_sub(2);
            }
        }
        length
    }

    fn extension_values(&self) -> ExtensionValues {
        ExtensionValues {
            transmission_time_offset: self.transmission_time_offset,
            absolute_send_time: self.absolute_send_time,
            voice_activity: true,
            audio_level_dbov: 0,
        }
    }
}

#[derive(Default)]
struct StatsState {
    rtp_stats: StreamDataCounters,
    rtx_rtp_stats: StreamDataCounters,
    send_delays: SendDelayWindow,
    bitrate_sent: Bitrate,
    nack_bitrate: Bitrate,
    frame_counts: HashMap<FrameType, u32>,
    rtp_stats_observer: Option<Arc<dyn StreamDataCountersObserver>>,
    frame_count_observer: Option<Arc<dyn FrameCountObserver>>,
    send_side_delay_observer: Option<Arc<dyn SendSideDelayObserver>>,
    bitrate_observer: Option<Arc<dyn BitrateObserver>>,
}

pub struct RtpSender {
    id: i32,
    audio_configured: bool,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    pacer: Option<Arc<dyn Pacer>>,
    ssrc_registry: Arc<SsrcRegistry>,
    send: Mutex<SendState>,
    stats: Mutex<StatsState>,
    target_bitrate: Mutex<u32>,
    history: Mutex<PacketHistory>,
}

impl RtpSender {
    pub fn new(
        id: i32,
        audio: bool,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        pacer: Option<Arc<dyn Pacer>>,
        ssrc_registry: Arc<SsrcRegistry>,
    ) -> Self {
        let ssrc = ssrc_registry.create_ssrc();
        let ssrc_rtx = ssrc_registry.create_ssrc();
        let media = if audio {
            MediaSender::Audio(AudioSender::new())
        } else {
            MediaSender::Video(VideoSender::new())
        };
        RtpSender {
            id,
            audio_configured: audio,
            clock,
            transport,
            pacer,
            ssrc_registry,
            send: Mutex::new(SendState {
                sending_media: true,
                max_payload_length: IP_PACKET_SIZE - UDP_IP_OVERHEAD,
                packet_over_head: UDP_IP_OVERHEAD as u16,
                payload_type: -1,
                payload_registry: PayloadRegistry::new(),
                extensions: ExtensionMap::new(),
                transmission_time_offset: 0,
                absolute_send_time: 0,
                start_timestamp_forced: false,
                start_timestamp: 0,
                sequence_number_forced: false,
                sequence_number: random_sequence_number(),
                sequence_number_rtx: random_sequence_number(),
                ssrc_forced: false,
                ssrc,
                ssrc_rtx,
                timestamp: 0,
                capture_time_ms: 0,
                last_timestamp_time_ms: 0,
                media_has_been_sent: false,
                last_packet_marker_bit: false,
                csrcs: Vec::new(),
                include_csrcs: true,
                rtx_mode: RTX_OFF,
                payload_type_rtx: -1,
                nack_limiter: NackRateLimiter::new(),
                media,
            }),
            stats: Mutex::new(StatsState::default()),
            target_bitrate: Mutex::new(0),
            history: Mutex::new(PacketHistory::new()),
        }
    }

    // ------------------------------------------------------------------
    // Outgoing media
    // ------------------------------------------------------------------

    /// Entry point for the media producer: packetizes one encoded frame and
    /// sends (or enqueues) the resulting packets.
    ///
    /// Returns `Ok(())` without sending when media is paused or the frame
    /// class is an empty video frame.
    pub fn send_outgoing_data(
        &self,
        frame_type: FrameType,
        payload_type: i8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &[u8],
        fragmentation: Option<&FragmentationHeader>,
    ) -> Result<()> {
        let ssrc = {
            let state = lock(&self.send);
            if !state.sending_media {
                return Ok(());
            }
            state.ssrc
        };
        self.check_payload_type(payload_type)?;

        if self.audio_configured {
            if !frame_type.is_audio() && frame_type != FrameType::Empty {
                debug_assert!(false, "video frame on an audio sender");
                return Err(Error::ErrInvalidFrameType);
            }
        } else {
            if frame_type.is_audio() {
                debug_assert!(false, "audio frame on a video sender");
                return Err(Error::ErrInvalidFrameType);
            }
            if frame_type == FrameType::Empty {
                return Ok(());
            }
        }

        let plans = {
            let mut state = lock(&self.send);
            let max_payload_length = state.max_data_payload_length();
            match &mut state.media {
                MediaSender::Audio(audio) => {
                    audio.packetize(frame_type, payload, max_payload_length)?
                }
                MediaSender::Video(video) => {
                    video.packetize(frame_type, payload, fragmentation, max_payload_length)?
                }
            }
        };

        for plan in plans {
            self.send_media_packet(payload_type, plan, capture_timestamp, capture_time_ms, frame_type)?;
        }

        let (count, observer) = {
            let mut stats = lock(&self.stats);
            let count = stats.frame_counts.entry(frame_type).or_insert(0);
            *count += 1;
            (*count, stats.frame_count_observer.clone())
        };
        if let Some(observer) = observer {
            observer.frame_count_updated(frame_type, count, ssrc);
        }
        Ok(())
    }

    /// Builds the header for one planned packet, appends its payload and
    /// pushes the result down the send path.
    fn send_media_packet(
        &self,
        payload_type: i8,
        plan: PacketPlan,
        capture_timestamp: u32,
        capture_time_ms: i64,
        frame_type: FrameType,
    ) -> Result<()> {
        let (buf, rtp_header_length) = {
            let mut state = lock(&self.send);
            let now_ms = self.clock.time_in_ms();
            let mut buf = BytesMut::with_capacity(state.max_payload_length);
            let rtp_header_length = Self::build_media_header(
                &mut state,
                &mut buf,
                payload_type,
                plan.marker,
                capture_timestamp,
                capture_time_ms,
                now_ms,
            )?;
            buf.extend_from_slice(&plan.payload);

            if state.extensions.is_registered(ExtensionKind::AudioLevel) {
                if let MediaSender::Audio(audio) = &state.media {
                    if let Ok(parsed) = header::parse(&buf) {
                        header::update_audio_level(
                            &mut buf,
                            &parsed,
                            &state.extensions,
                            frame_type == FrameType::AudioSpeech,
                            audio.audio_level(),
                        );
                    }
                }
            }
            (buf, rtp_header_length)
        };
        let payload_length = buf.len() - rtp_header_length;
        self.send_to_network(
            buf,
            payload_length,
            capture_time_ms,
            plan.storage,
            plan.priority,
        )
    }

    /// Assigns the next sequence number and timestamp and serializes the
    /// header. The marker bit is recorded even if the send later fails.
    fn build_media_header(
        state: &mut SendState,
        buf: &mut BytesMut,
        payload_type: i8,
        marker: bool,
        capture_timestamp: u32,
        capture_time_ms: i64,
        now_ms: i64,
    ) -> Result<usize> {
        debug_assert!(payload_type >= 0);
        state.timestamp = state.start_timestamp.wrapping_add(capture_timestamp);
        state.last_timestamp_time_ms = now_ms;
        state.capture_time_ms = capture_time_ms;
        state.last_packet_marker_bit = marker;
        let sequence_number = state.sequence_number;
        state.sequence_number = state.sequence_number.wrapping_add(1);

        let values = state.extension_values();
        let csrcs: &[u32] = if state.include_csrcs { &state.csrcs } else { &[] };
        header::build_rtp_header(
            buf,
            payload_type,
            state.ssrc,
            marker,
            state.timestamp,
            sequence_number,
            csrcs,
            &state.extensions,
            &values,
        )
    }

    /// Stamps the send-time extensions, records the packet in the history
    /// and either hands it to the pacer or sends it right away.
    fn send_to_network(
        &self,
        mut buf: BytesMut,
        payload_length: usize,
        capture_time_ms: i64,
        storage: StorageKind,
        priority: PacketPriority,
    ) -> Result<()> {
        let parsed = match header::parse(&buf) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug_assert!(false, "freshly built packet failed to parse");
                return Err(err);
            }
        };
        let now_ms = self.clock.time_in_ms();
        {
            let state = lock(&self.send);
            if capture_time_ms > 0 {
                header::update_transmission_time_offset(
                    &mut buf,
                    &parsed,
                    &state.extensions,
                    now_ms - capture_time_ms,
                );
            }
            header::update_absolute_send_time(&mut buf, &parsed, &state.extensions, now_ms);
        }

        lock(&self.history).put(&buf, parsed.sequence_number, capture_time_ms, now_ms, storage);

        if storage != StorageKind::DontStore {
            if let Some(pacer) = &self.pacer {
                if !pacer.enqueue(
                    priority,
                    parsed.ssrc,
                    parsed.sequence_number,
                    capture_time_ms,
                    payload_length,
                    false,
                ) {
                    // Queued; the pacer calls back when it is time to send.
                    return Ok(());
                }
            }
        }

        if capture_time_ms > 0 {
            self.update_delay_statistics(capture_time_ms, now_ms);
        }
        if !self.send_packet_to_network(&buf) {
            return Err(Error::ErrTransportFailed);
        }
        lock(&self.send).media_has_been_sent = true;
        self.update_rtp_stats(&buf, &parsed, false, false);
        Ok(())
    }

    fn send_packet_to_network(&self, packet: &[u8]) -> bool {
        let bytes_sent = self.transport.send_packet(self.id, packet);
        if bytes_sent <= 0 {
            warn!("transport failed to send packet");
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // Pacer callbacks
    // ------------------------------------------------------------------

    /// Pacer callback: a previously enqueued packet's turn has arrived.
    ///
    /// Returns true when the pacer may move on, which includes the case
    /// where the packet has aged out of the history.
    pub fn time_to_send_packet(
        &self,
        sequence_number: u16,
        capture_time_ms: i64,
        retransmission: bool,
    ) -> bool {
        let now_ms = self.clock.time_in_ms();
        let stored = lock(&self.history).get_and_mark_sent(sequence_number, now_ms, 0, retransmission);
        let Some((packet, _)) = stored else {
            return true;
        };
        if !retransmission && capture_time_ms > 0 {
            self.update_delay_statistics(capture_time_ms, now_ms);
        }
        let rtx_mode = lock(&self.send).rtx_mode;
        self.prepare_and_send_packet(
            packet,
            capture_time_ms,
            retransmission && rtx_mode & RTX_RETRANSMITTED != 0,
            retransmission,
        )
    }

    /// Pacer callback asking for `bytes` of filler. Repays stored payloads
    /// first when RTX redundant mode is on, then synthesizes padding-only
    /// packets. Returns the bytes actually sent, which rounds *up* to whole
    /// padding packets.
    pub fn time_to_send_padding(&self, bytes: usize) -> usize {
        if bytes == 0 {
            return 0;
        }
        let now_ms = self.clock.time_in_ms();
        let (payload_type, timestamp, capture_time_ms, rtx_mode) = {
            let state = lock(&self.send);
            if !state.sending_media {
                return 0;
            }
            let payload_type = if state.rtx_mode & RTX_REDUNDANT_PAYLOADS != 0 {
                state.payload_type_rtx
            } else {
                state.payload_type
            };
            let mut timestamp = state.timestamp;
            let mut capture_time_ms = state.capture_time_ms;
            if state.last_timestamp_time_ms > 0 {
                // Advance from the last media stamp so the receiver sees
                // monotonic time.
                let elapsed_ms = now_ms - state.last_timestamp_time_ms;
                timestamp = timestamp.wrapping_add((elapsed_ms * 90) as u32);
                capture_time_ms += elapsed_ms;
            }
            (payload_type, timestamp, capture_time_ms, state.rtx_mode)
        };

        let mut bytes_sent = 0;
        if rtx_mode & RTX_REDUNDANT_PAYLOADS != 0 {
            bytes_sent = self.send_redundant_payloads(bytes);
        }
        let remaining = bytes.saturating_sub(bytes_sent);
        if remaining > 0 {
            bytes_sent += self.send_pad_data(payload_type, timestamp, capture_time_ms, remaining);
        }
        bytes_sent
    }

    /// Resends stored payloads, largest-fitting first, until the budget is
    /// repaid or nothing fits. Not counted as retransmissions.
    fn send_redundant_payloads(&self, bytes_to_send: usize) -> usize {
        let mut bytes_left = bytes_to_send;
        let mut bytes_sent = 0;
        while bytes_left > 0 {
            let best = lock(&self.history).get_best_fitting(bytes_left);
            let Some((packet, capture_time_ms)) = best else {
                break;
            };
            let Ok(parsed) = header::parse(&packet) else {
                debug_assert!(false, "malformed packet in history");
                break;
            };
            let payload_size = packet.len() - parsed.header_length;
            if payload_size == 0 {
                break;
            }
            if !self.prepare_and_send_packet(packet, capture_time_ms, true, false) {
                break;
            }
            bytes_sent += payload_size;
            bytes_left = bytes_left.saturating_sub(payload_size);
        }
        bytes_sent
    }

    /// Sends padding-only packets until `bytes` is covered, always emitting
    /// full `MAX_PADDING_LENGTH` runs.
    fn send_pad_data(
        &self,
        payload_type: i8,
        timestamp: u32,
        capture_time_ms: i64,
        mut bytes: usize,
    ) -> usize {
        let mut bytes_sent = 0;
        loop {
            // Always send full padding packets.
            if bytes < MAX_PADDING_LENGTH {
                bytes = MAX_PADDING_LENGTH;
            }

            let built = {
                let mut state = lock(&self.send);
                let (ssrc, sequence_number, over_rtx) = if state.rtx_mode == RTX_OFF {
                    // Padding may only follow a frame boundary.
                    if !state.last_packet_marker_bit {
                        return bytes_sent;
                    }
                    let sequence_number = state.sequence_number;
                    state.sequence_number = state.sequence_number.wrapping_add(1);
                    (state.ssrc, sequence_number, false)
                } else {
                    // Without abs-send-time the receiver has no timing
                    // reference until real media has gone out.
                    if !state.media_has_been_sent
                        && !state.extensions.is_registered(ExtensionKind::AbsoluteSendTime)
                    {
                        return bytes_sent;
                    }
                    let sequence_number = state.sequence_number_rtx;
                    state.sequence_number_rtx = state.sequence_number_rtx.wrapping_add(1);
                    (state.ssrc_rtx, sequence_number, true)
                };
                let mut buf = BytesMut::with_capacity(state.rtp_header_length() + MAX_PADDING_LENGTH);
                let values = state.extension_values();
                match header::build_rtp_header(
                    &mut buf,
                    payload_type,
                    ssrc,
                    false,
                    timestamp,
                    sequence_number,
                    &[],
                    &state.extensions,
                    &values,
                ) {
                    Ok(_) => Some((buf, over_rtx)),
                    Err(_) => None,
                }
            };
            let Some((mut buf, over_rtx)) = built else {
                return bytes_sent;
            };

            let padding_length = MAX_PADDING_LENGTH.min(bytes);
            header::append_padding(&mut buf, padding_length);
            let Ok(parsed) = header::parse(&buf) else {
                debug_assert!(false, "freshly built padding packet failed to parse");
                return bytes_sent;
            };

            let now_ms = self.clock.time_in_ms();
            {
                let state = lock(&self.send);
                if capture_time_ms > 0 {
                    header::update_transmission_time_offset(
                        &mut buf,
                        &parsed,
                        &state.extensions,
                        now_ms - capture_time_ms,
                    );
                }
                header::update_absolute_send_time(&mut buf, &parsed, &state.extensions, now_ms);
            }

            if !self.send_packet_to_network(&buf) {
                return bytes_sent;
            }
            bytes_sent += padding_length;
            self.update_rtp_stats(&buf, &parsed, over_rtx, false);

            bytes -= padding_length;
            if bytes == 0 {
                return bytes_sent;
            }
        }
    }

    // ------------------------------------------------------------------
    // NACK response
    // ------------------------------------------------------------------

    /// Feedback-thread entry point: answers a NACK list, bounded by the
    /// NACK rate limiter and the delay-bandwidth product.
    pub fn on_received_nack(&self, sequence_numbers: &[u16], avg_rtt_ms: i64) {
        let now_ms = self.clock.time_in_ms();
        let target_bitrate = self.target_bitrate();
        if !lock(&self.send).nack_limiter.should_send(now_ms, target_bitrate) {
            info!("NACK bitrate reached, skip sending NACK response, target {target_bitrate}");
            return;
        }

        let mut bytes_resent: u64 = 0;
        for &sequence_number in sequence_numbers {
            match self.re_send_packet(sequence_number, 5 + avg_rtt_ms) {
                Ok(0) => {
                    // Resent recently; try the next one in the list.
                    continue;
                }
                Ok(bytes) => bytes_resent += bytes as u64,
                Err(err) => {
                    warn!(
                        "failed resending rtp packet {sequence_number}, discard rest of nack list: {err}"
                    );
                    break;
                }
            }
            if target_bitrate != 0 && avg_rtt_ms > 0 {
                // Delay-bandwidth product: kbits/s * ms = bits, /8 = bytes.
                let target_bytes = u64::from(target_bitrate / 1000) * avg_rtt_ms as u64 / 8;
                if bytes_resent > target_bytes {
                    break;
                }
            }
        }
        if bytes_resent > 0 {
            lock(&self.send)
                .nack_limiter
                .record(bytes_resent.min(u64::from(u32::MAX)) as u32, now_ms);
            lock(&self.stats).nack_bitrate.update(bytes_resent as usize);
        }
    }

    /// Resends one packet from the history. Returns the bytes resent, with
    /// 0 meaning "skipped" (absent, or resent more recently than
    /// `min_resend_age_ms`).
    fn re_send_packet(&self, sequence_number: u16, min_resend_age_ms: i64) -> Result<usize> {
        let now_ms = self.clock.time_in_ms();
        let stored =
            lock(&self.history).get_and_mark_sent(sequence_number, now_ms, min_resend_age_ms, false);
        let Some((packet, capture_time_ms)) = stored else {
            return Ok(0);
        };

        if let Some(pacer) = &self.pacer {
            let parsed = match header::parse(&packet) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug_assert!(false, "malformed packet in history");
                    return Err(err);
                }
            };
            if !pacer.enqueue(
                PacketPriority::High,
                parsed.ssrc,
                parsed.sequence_number,
                capture_time_ms,
                packet.len() - parsed.header_length,
                true,
            ) {
                // Queued; the pacer will call back when it is time.
                return Ok(packet.len());
            }
        }

        let rtx_mode = lock(&self.send).rtx_mode;
        let length = packet.len();
        if self.prepare_and_send_packet(
            packet,
            capture_time_ms,
            rtx_mode & RTX_RETRANSMITTED != 0,
            true,
        ) {
            Ok(length)
        } else {
            Err(Error::ErrTransportFailed)
        }
    }

    /// Final egress step shared by resends, pacer callbacks and redundant
    /// payloads: optional RTX wrap, send-time restamp, transport, stats.
    fn prepare_and_send_packet(
        &self,
        packet: BytesMut,
        capture_time_ms: i64,
        send_over_rtx: bool,
        is_retransmit: bool,
    ) -> bool {
        let mut out = packet;
        if send_over_rtx {
            let Ok(parsed) = header::parse(&out) else {
                debug_assert!(false, "malformed packet in history");
                return false;
            };
            out = {
                let mut state = lock(&self.send);
                Self::build_rtx_packet(&mut state, &out, &parsed)
            };
        }
        let Ok(parsed) = header::parse(&out) else {
            debug_assert!(false, "malformed outgoing packet");
            return false;
        };

        let now_ms = self.clock.time_in_ms();
        {
            let state = lock(&self.send);
            header::update_transmission_time_offset(
                &mut out,
                &parsed,
                &state.extensions,
                now_ms - capture_time_ms,
            );
            header::update_absolute_send_time(&mut out, &parsed, &state.extensions, now_ms);
        }

        if !self.send_packet_to_network(&out) {
            return false;
        }
        lock(&self.send).media_has_been_sent = true;
        self.update_rtp_stats(&out, &parsed, send_over_rtx, is_retransmit);
        true
    }

    /// RFC 4588 wrap: the original header verbatim except payload type
    /// (optional), sequence number and SSRC, then the original sequence
    /// number, then the original payload.
    fn build_rtx_packet(
        state: &mut SendState,
        packet: &[u8],
        parsed: &header::ParsedHeader,
    ) -> BytesMut {
        let mut rtx = BytesMut::with_capacity(packet.len() + 2);
        rtx.extend_from_slice(&packet[..parsed.header_length]);

        if state.payload_type_rtx != -1 {
            rtx[1] = (state.payload_type_rtx as u8 & 0x7F)
                | if parsed.marker { 0x80 } else { 0 };
        }

        let sequence_number_rtx = state.sequence_number_rtx;
        state.sequence_number_rtx = state.sequence_number_rtx.wrapping_add(1);
        rtx[2..4].copy_from_slice(&sequence_number_rtx.to_be_bytes());
        rtx[8..12].copy_from_slice(&state.ssrc_rtx.to_be_bytes());

        rtx.extend_from_slice(&parsed.sequence_number.to_be_bytes());
        rtx.extend_from_slice(&packet[parsed.header_length..]);
        rtx
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    fn update_delay_statistics(&self, capture_time_ms: i64, now_ms: i64) {
        let ssrc = lock(&self.send).ssrc;
        let (observer, report) = {
            let mut stats = lock(&self.stats);
            stats.send_delays.add(now_ms, now_ms - capture_time_ms);
            (
                stats.send_side_delay_observer.clone(),
                stats.send_delays.report(now_ms),
            )
        };
        if let (Some(observer), Some((avg_delay_ms, max_delay_ms))) = (observer, report) {
            observer.send_side_delay_updated(avg_delay_ms, max_delay_ms, ssrc);
        }
    }

    fn update_rtp_stats(
        &self,
        packet: &[u8],
        parsed: &header::ParsedHeader,
        is_rtx: bool,
        is_retransmit: bool,
    ) {
        let (ssrc, is_fec) = {
            let state = lock(&self.send);
            let ssrc = if is_rtx { state.ssrc_rtx } else { state.ssrc };
            let is_fec = match &state.media {
                MediaSender::Video(video) => {
                    let (fec_enabled, red_payload_type, fec_payload_type) =
                        video.generic_fec_status();
                    fec_enabled
                        && parsed.payload_type == red_payload_type
                        && packet.len() > parsed.header_length
                        && packet[parsed.header_length] == fec_payload_type
                }
                MediaSender::Audio(_) => false,
            };
            (ssrc, is_fec)
        };

        let mut stats = lock(&self.stats);
        stats.bitrate_sent.update(packet.len());
        let counters = if is_rtx {
            &mut stats.rtx_rtp_stats
        } else {
            &mut stats.rtp_stats
        };
        counters.packets = counters.packets.wrapping_add(1);
        if is_fec {
            counters.fec_packets = counters.fec_packets.wrapping_add(1);
        }
        if is_retransmit {
            counters.retransmitted_packets = counters.retransmitted_packets.wrapping_add(1);
        } else {
            counters.bytes +=
                (packet.len() - parsed.header_length - parsed.padding_length) as u64;
            counters.header_bytes += parsed.header_length as u64;
            counters.padding_bytes += parsed.padding_length as u64;
        }
        let snapshot = *counters;
        // By contract the counters observer must not call back into the
        // sender; it is the one callback made under the stats lock.
        if let Some(observer) = &stats.rtp_stats_observer {
            observer.data_counters_updated(&snapshot, ssrc);
        }
    }

    /// Periodic tick from the process thread: recomputes the bitrate
    /// estimators and notifies the bitrate observer.
    pub fn process_bitrate(&self) {
        let now_ms = self.clock.time_in_ms();
        let (sent, observer) = {
            let mut stats = lock(&self.stats);
            let sent = stats.bitrate_sent.process(now_ms);
            stats.nack_bitrate.process(now_ms);
            (sent, stats.bitrate_observer.clone())
        };
        if let (Some(stats), Some(observer)) = (sent, observer) {
            let ssrc = lock(&self.send).ssrc;
            observer.bitrate_updated(&stats, ssrc);
        }
    }

    pub fn actual_send_bitrate_kbit(&self) -> u16 {
        (lock(&self.stats).bitrate_sent.bitrate_last() / 1000) as u16
    }

    pub fn bitrate_sent(&self) -> u32 {
        lock(&self.stats).bitrate_sent.bitrate_last()
    }

    pub fn nack_overhead_rate(&self) -> u32 {
        lock(&self.stats).nack_bitrate.bitrate_last()
    }

    /// Counters for the primary and RTX streams.
    pub fn data_counters(&self) -> (StreamDataCounters, StreamDataCounters) {
        let stats = lock(&self.stats);
        (stats.rtp_stats, stats.rtx_rtp_stats)
    }

    pub fn reset_data_counters(&self) {
        let (ssrc, ssrc_rtx) = {
            let state = lock(&self.send);
            (state.ssrc, state.ssrc_rtx)
        };
        let mut stats = lock(&self.stats);
        stats.rtp_stats = StreamDataCounters::default();
        stats.rtx_rtp_stats = StreamDataCounters::default();
        if let Some(observer) = &stats.rtp_stats_observer {
            observer.data_counters_updated(&stats.rtp_stats, ssrc);
            observer.data_counters_updated(&stats.rtx_rtp_stats, ssrc_rtx);
        }
    }

    pub fn send_side_delay(&self) -> Option<(i64, i64)> {
        let now_ms = self.clock.time_in_ms();
        lock(&self.stats).send_delays.report(now_ms)
    }

    // ------------------------------------------------------------------
    // Payload types
    // ------------------------------------------------------------------

    pub fn register_payload(
        &self,
        name: &str,
        payload_type: i8,
        frequency: u32,
        channels: u8,
        rate: u32,
    ) -> Result<()> {
        let mut state = lock(&self.send);
        state
            .payload_registry
            .register(self.audio_configured, name, payload_type, frequency, channels, rate)?;
        if let MediaSender::Audio(audio) = &mut state.media {
            if name.eq_ignore_ascii_case("telephone-event") {
                audio.set_dtmf_payload_type(payload_type);
            }
        }
        Ok(())
    }

    pub fn deregister_payload(&self, payload_type: i8) -> Result<()> {
        lock(&self.send).payload_registry.deregister(payload_type)
    }

    /// Accepts the frame's payload type, switching the current media
    /// settings when it differs from the previous one.
    fn check_payload_type(&self, payload_type: i8) -> Result<()> {
        let mut state = lock(&self.send);
        if payload_type < 0 {
            error!("invalid payload type {payload_type}");
            return Err(Error::ErrInvalidPayloadType);
        }
        if let MediaSender::Audio(audio) = &state.media {
            // RED wraps payloads registered elsewhere.
            if audio.red_payload_type() == Some(payload_type) {
                return Ok(());
            }
        }
        if state.payload_type == payload_type {
            return Ok(());
        }
        let kind = match state.payload_registry.get(payload_type) {
            Some(payload) => payload.kind.clone(),
            None => {
                warn!("payload type {payload_type} not registered");
                return Err(Error::ErrUnknownPayloadType);
            }
        };
        state.payload_type = payload_type;
        match (&mut state.media, kind) {
            (MediaSender::Video(video), PayloadKind::Video { codec, max_rate }) => {
                video.set_codec(codec);
                video.set_max_configured_bitrate(max_rate);
            }
            (MediaSender::Audio(audio), PayloadKind::Audio { frequency, .. }) => {
                audio.set_frequency(frequency);
            }
            _ => debug_assert!(false, "payload kind does not match sender mode"),
        }
        Ok(())
    }

    pub fn send_payload_type(&self) -> i8 {
        lock(&self.send).payload_type
    }

    pub fn send_payload_frequency(&self) -> u32 {
        let state = lock(&self.send);
        match &state.media {
            MediaSender::Audio(audio) => audio.frequency(),
            MediaSender::Video(_) => VIDEO_PAYLOAD_TYPE_FREQUENCY,
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_max_payload_length(
        &self,
        max_payload_length: usize,
        packet_over_head: u16,
    ) -> Result<()> {
        if !(100..=IP_PACKET_SIZE).contains(&max_payload_length) {
            error!("invalid max payload length {max_payload_length}");
            return Err(Error::ErrInvalidMaxPayloadLength);
        }
        let mut state = lock(&self.send);
        state.max_payload_length = max_payload_length;
        state.packet_over_head = packet_over_head;
        Ok(())
    }

    pub fn max_payload_length(&self) -> usize {
        lock(&self.send).max_payload_length
    }

    pub fn max_data_payload_length(&self) -> usize {
        lock(&self.send).max_data_payload_length()
    }

    pub fn packet_over_head(&self) -> u16 {
        lock(&self.send).packet_over_head
    }

    pub fn register_rtp_header_extension(&self, kind: ExtensionKind, id: u8) -> Result<()> {
        lock(&self.send).extensions.register(kind, id)
    }

    pub fn deregister_rtp_header_extension(&self, kind: ExtensionKind) {
        lock(&self.send).extensions.deregister(kind);
    }

    pub fn rtp_header_extension_total_length(&self) -> usize {
        lock(&self.send).extensions.total_length_in_bytes()
    }

    /// Sets the transmission-time-offset value written at build time.
    /// 24-bit signed range.
    pub fn set_transmission_time_offset(&self, transmission_time_offset: i32) -> Result<()> {
        if !(-0x7F_FFFF..=0x7F_FFFF).contains(&transmission_time_offset) {
            return Err(Error::ErrExtensionValueOutOfRange);
        }
        lock(&self.send).transmission_time_offset = transmission_time_offset;
        Ok(())
    }

    /// Sets the absolute-send-time value written at build time. 24-bit
    /// unsigned range.
    pub fn set_absolute_send_time(&self, absolute_send_time: u32) -> Result<()> {
        if absolute_send_time > 0x00FF_FFFF {
            return Err(Error::ErrExtensionValueOutOfRange);
        }
        lock(&self.send).absolute_send_time = absolute_send_time;
        Ok(())
    }

    pub fn set_csrcs(&self, csrcs: &[u32]) -> Result<()> {
        if csrcs.len() > header::MAX_CSRCS {
            debug_assert!(false, "CSRC list too long");
            return Err(Error::ErrTooManyCsrcs);
        }
        lock(&self.send).csrcs = csrcs.to_vec();
        Ok(())
    }

    pub fn csrcs(&self) -> Vec<u32> {
        lock(&self.send).csrcs.clone()
    }

    pub fn set_csrc_status(&self, include: bool) {
        lock(&self.send).include_csrcs = include;
    }

    pub fn set_store_packets_status(&self, enable: bool, number_to_store: u16) {
        lock(&self.history).set_store_packets_status(enable, number_to_store);
    }

    pub fn store_packets(&self) -> bool {
        lock(&self.history).store_packets()
    }

    pub fn set_rtx_status(&self, rtx_mode: u8) {
        lock(&self.send).rtx_mode = rtx_mode;
    }

    /// Current RTX configuration: (mode, RTX SSRC, RTX payload type).
    pub fn rtx_status(&self) -> (u8, u32, i8) {
        let state = lock(&self.send);
        (state.rtx_mode, state.ssrc_rtx, state.payload_type_rtx)
    }

    pub fn set_rtx_ssrc(&self, ssrc: u32) {
        lock(&self.send).ssrc_rtx = ssrc;
    }

    pub fn rtx_ssrc(&self) -> u32 {
        lock(&self.send).ssrc_rtx
    }

    pub fn set_rtx_payload_type(&self, payload_type: i8) {
        lock(&self.send).payload_type_rtx = payload_type;
    }

    pub fn set_target_bitrate(&self, bitrate: u32) {
        *lock(&self.target_bitrate) = bitrate;
    }

    pub fn target_bitrate(&self) -> u32 {
        *lock(&self.target_bitrate)
    }

    // ------------------------------------------------------------------
    // Lifecycle, SSRC and sequence space
    // ------------------------------------------------------------------

    pub fn set_sending_status(&self, enabled: bool) {
        if enabled {
            let frequency = self.send_payload_frequency();
            let now_ms = self.clock.time_in_ms();
            let rtp_time = (now_ms.wrapping_mul(i64::from(frequency)) / 1000) as u32;
            // Ignored if the start timestamp was configured via the API.
            self.set_start_timestamp(rtp_time, false);
        } else {
            let mut state = lock(&self.send);
            if !state.ssrc_forced {
                self.ssrc_registry.return_ssrc(state.ssrc);
                state.ssrc = self.ssrc_registry.create_ssrc();
            }
            // Don't reset the sequence space if the SSRC came from outside.
            if !state.sequence_number_forced && !state.ssrc_forced {
                state.sequence_number = random_sequence_number();
            }
        }
    }

    pub fn set_sending_media_status(&self, enabled: bool) {
        lock(&self.send).sending_media = enabled;
    }

    pub fn sending_media(&self) -> bool {
        lock(&self.send).sending_media
    }

    pub fn ssrc(&self) -> u32 {
        lock(&self.send).ssrc
    }

    /// Forces the SSRC. Returns the previous one to the registry and
    /// regenerates the sequence number unless that was forced too. Setting
    /// the already-forced value is a no-op.
    pub fn set_ssrc(&self, ssrc: u32) {
        let mut state = lock(&self.send);
        if state.ssrc == ssrc && state.ssrc_forced {
            return;
        }
        state.ssrc_forced = true;
        self.ssrc_registry.return_ssrc(state.ssrc);
        self.ssrc_registry.register_ssrc(ssrc);
        state.ssrc = ssrc;
        if !state.sequence_number_forced {
            state.sequence_number = random_sequence_number();
        }
    }

    /// Rotates to a fresh SSRC, or returns 0 when the SSRC is forced.
    pub fn generate_new_ssrc(&self) -> u32 {
        let mut state = lock(&self.send);
        if state.ssrc_forced {
            return 0;
        }
        self.ssrc_registry.return_ssrc(state.ssrc);
        state.ssrc = self.ssrc_registry.create_ssrc();
        state.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        lock(&self.send).sequence_number
    }

    pub fn set_sequence_number(&self, sequence_number: u16) {
        let mut state = lock(&self.send);
        state.sequence_number_forced = true;
        state.sequence_number = sequence_number;
    }

    /// Consumes one sequence number and returns it.
    pub fn increment_sequence_number(&self) -> u16 {
        let mut state = lock(&self.send);
        let sequence_number = state.sequence_number;
        state.sequence_number = state.sequence_number.wrapping_add(1);
        sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        lock(&self.send).timestamp
    }

    pub fn start_timestamp(&self) -> u32 {
        lock(&self.send).start_timestamp
    }

    pub fn set_start_timestamp(&self, timestamp: u32, force: bool) {
        let mut state = lock(&self.send);
        if force {
            state.start_timestamp_forced = true;
            state.start_timestamp = timestamp;
        } else if !state.start_timestamp_forced {
            state.start_timestamp = timestamp;
        }
    }

    pub fn rtp_state(&self) -> RtpState {
        let state = lock(&self.send);
        RtpState {
            sequence_number: state.sequence_number,
            start_timestamp: state.start_timestamp,
            timestamp: state.timestamp,
            capture_time_ms: state.capture_time_ms,
            last_timestamp_time_ms: state.last_timestamp_time_ms,
            media_has_been_sent: state.media_has_been_sent,
        }
    }

    pub fn set_rtp_state(&self, rtp_state: RtpState) {
        let mut state = lock(&self.send);
        state.start_timestamp_forced = true;
        state.start_timestamp = rtp_state.start_timestamp;
        state.sequence_number = rtp_state.sequence_number;
        state.sequence_number_forced = true;
        state.timestamp = rtp_state.timestamp;
        state.capture_time_ms = rtp_state.capture_time_ms;
        state.last_timestamp_time_ms = rtp_state.last_timestamp_time_ms;
        state.media_has_been_sent = rtp_state.media_has_been_sent;
    }

    pub fn rtx_rtp_state(&self) -> RtpState {
        let state = lock(&self.send);
        RtpState {
            sequence_number: state.sequence_number_rtx,
            start_timestamp: state.start_timestamp,
            ..Default::default()
        }
    }

    pub fn set_rtx_rtp_state(&self, rtp_state: RtpState) {
        lock(&self.send).sequence_number_rtx = rtp_state.sequence_number;
    }

    // ------------------------------------------------------------------
    // Audio configuration
    // ------------------------------------------------------------------

    fn with_audio<T>(&self, f: impl FnOnce(&mut AudioSender) -> T) -> Result<T> {
        let mut state = lock(&self.send);
        match &mut state.media {
            MediaSender::Audio(audio) => Ok(f(audio)),
            MediaSender::Video(_) => Err(Error::ErrNotAudioSender),
        }
    }

    fn with_video<T>(&self, f: impl FnOnce(&mut VideoSender) -> T) -> Result<T> {
        let mut state = lock(&self.send);
        match &mut state.media {
            MediaSender::Video(video) => Ok(f(video)),
            MediaSender::Audio(_) => Err(Error::ErrNotVideoSender),
        }
    }

    /// Configures the RED payload type; a negative value disables RED.
    pub fn set_red_payload_type(&self, payload_type: i8) -> Result<()> {
        self.with_audio(|audio| {
            audio.set_red_payload_type(if payload_type < 0 { None } else { Some(payload_type) })
        })
    }

    pub fn red_payload_type(&self) -> Result<Option<i8>> {
        self.with_audio(|audio| audio.red_payload_type())
    }

    pub fn set_audio_packet_size(&self, packet_size_samples: u16) -> Result<()> {
        self.with_audio(|audio| audio.set_packet_size_samples(packet_size_samples))
    }

    pub fn set_audio_level(&self, level_dbov: u8) -> Result<()> {
        self.with_audio(|audio| audio.set_audio_level(level_dbov))?
    }

    /// Emits one RFC 4733 telephone event packet, carrying the timestamp of
    /// the audio it interrupts.
    pub fn send_telephone_event(&self, key: u8, duration_ms: u16, level: u8) -> Result<()> {
        let (buf, rtp_header_length, capture_time_ms) = {
            let mut state = lock(&self.send);
            if !state.sending_media {
                return Ok(());
            }
            let (event_payload_type, event) = match &mut state.media {
                MediaSender::Audio(audio) => match audio.dtmf_payload_type() {
                    Some(payload_type) => {
                        (payload_type, audio.telephone_event_payload(key, duration_ms, level))
                    }
                    None => return Err(Error::ErrUnknownPayloadType),
                },
                MediaSender::Video(_) => return Err(Error::ErrNotAudioSender),
            };
            let now_ms = self.clock.time_in_ms();
            let capture_timestamp = state.timestamp.wrapping_sub(state.start_timestamp);
            let mut buf = BytesMut::with_capacity(state.max_payload_length);
            let rtp_header_length = Self::build_media_header(
                &mut state,
                &mut buf,
                event_payload_type,
                true,
                capture_timestamp,
                now_ms,
                now_ms,
            )?;
            buf.extend_from_slice(&event);
            (buf, rtp_header_length, now_ms)
        };
        let payload_length = buf.len() - rtp_header_length;
        self.send_to_network(
            buf,
            payload_length,
            capture_time_ms,
            StorageKind::AllowRetransmission,
            PacketPriority::High,
        )
    }

    // ------------------------------------------------------------------
    // Video configuration
    // ------------------------------------------------------------------

    pub fn set_generic_fec_status(
        &self,
        enabled: bool,
        red_payload_type: u8,
        fec_payload_type: u8,
    ) -> Result<()> {
        self.with_video(|video| {
            video.set_generic_fec_status(enabled, red_payload_type, fec_payload_type)
        })
    }

    pub fn generic_fec_status(&self) -> Result<(bool, u8, u8)> {
        self.with_video(|video| video.generic_fec_status())
    }

    pub fn set_fec_parameters(
        &self,
        delta_params: FecProtectionParams,
        key_params: FecProtectionParams,
    ) -> Result<()> {
        self.with_video(|video| video.set_fec_parameters(delta_params, key_params))
    }

    pub fn set_selective_retransmissions(&self, settings: u8) -> Result<()> {
        self.with_video(|video| video.set_selective_retransmissions(settings))
    }

    pub fn selective_retransmissions(&self) -> Result<u8> {
        self.with_video(|video| video.selective_retransmissions())
    }

    pub fn video_codec(&self) -> Result<VideoCodec> {
        self.with_video(|video| video.codec())
    }

    pub fn max_configured_bitrate_video(&self) -> u32 {
        self.with_video(|video| video.max_configured_bitrate())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn set_frame_count_observer(&self, observer: Option<Arc<dyn FrameCountObserver>>) {
        lock(&self.stats).frame_count_observer = observer;
    }

    pub fn set_rtp_statistics_observer(
        &self,
        observer: Option<Arc<dyn StreamDataCountersObserver>>,
    ) {
        lock(&self.stats).rtp_stats_observer = observer;
    }

    pub fn set_send_side_delay_observer(&self, observer: Option<Arc<dyn SendSideDelayObserver>>) {
        lock(&self.stats).send_side_delay_observer = observer;
    }

    pub fn set_bitrate_observer(&self, observer: Option<Arc<dyn BitrateObserver>>) {
        lock(&self.stats).bitrate_observer = observer;
    }
}

impl Drop for RtpSender {
    fn drop(&mut self) {
        let state = lock(&self.send);
        self.ssrc_registry.return_ssrc(state.ssrc);
        self.ssrc_registry.return_ssrc(state.ssrc_rtx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: Mutex<bool>,
    }

    impl MockTransport {
        fn sent_packets(&self) -> Vec<Vec<u8>> {
            lock(&self.sent).clone()
        }

        fn set_fail(&self, fail: bool) {
            *lock(&self.fail) = fail;
        }
    }

    impl Transport for MockTransport {
        fn send_packet(&self, _channel_id: i32, packet: &[u8]) -> isize {
            if *lock(&self.fail) {
                return -1;
            }
            lock(&self.sent).push(packet.to_vec());
            packet.len() as isize
        }
    }

    fn video_sender(now_ms: i64) -> (RtpSender, Arc<MockTransport>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let transport = Arc::new(MockTransport::default());
        let sender = RtpSender::new(
            1,
            false,
            clock.clone(),
            transport.clone(),
            None,
            Arc::new(SsrcRegistry::new()),
        );
        (sender, transport, clock)
    }

    fn send_video_frame(sender: &RtpSender, payload: &[u8]) {
        sender
            .send_outgoing_data(FrameType::VideoDelta, 96, 3000, 10, payload, None)
            .unwrap();
    }

    #[test]
    fn test_sequence_numbers_monotonic() {
        let (sender, transport, _clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();

        for _ in 0..3 {
            send_video_frame(&sender, &[1, 2, 3]);
        }

        let packets = transport.sent_packets();
        assert_eq!(packets.len(), 3);
        let first = header::parse(&packets[0]).unwrap().sequence_number;
        for (i, packet) in packets.iter().enumerate() {
            let parsed = header::parse(packet).unwrap();
            assert_eq!(parsed.sequence_number, first.wrapping_add(i as u16));
            assert_eq!(parsed.version, 2);
        }
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        let (sender, transport, _clock) = video_sender(1000);
        assert_eq!(
            sender.send_outgoing_data(FrameType::VideoDelta, 96, 0, 0, &[0], None),
            Err(Error::ErrUnknownPayloadType)
        );
        assert!(transport.sent_packets().is_empty());
    }

    #[test]
    fn test_paused_sender_drops_silently() {
        let (sender, transport, _clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();
        sender.set_sending_media_status(false);

        sender
            .send_outgoing_data(FrameType::VideoDelta, 96, 0, 0, &[0], None)
            .unwrap();
        assert!(transport.sent_packets().is_empty());
    }

    #[test]
    fn test_rtx_wrap_layout() {
        let (sender, transport, clock) = video_sender(0);
        sender.set_store_packets_status(true, 100);
        sender.set_rtx_status(RTX_RETRANSMITTED);
        sender.set_rtx_payload_type(101);
        sender.set_rtx_ssrc(0xB);
        sender.set_rtx_rtp_state(RtpState {
            sequence_number: 5,
            ..Default::default()
        });

        // A stored 12-byte-header packet: PT=100, seq=42, ssrc=0xA.
        let mut original = BytesMut::new();
        header::build_rtp_header(
            &mut original,
            100,
            0xA,
            false,
            0x11223344,
            42,
            &[],
            &ExtensionMap::new(),
            &ExtensionValues::default(),
        )
        .unwrap();
        original.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        lock(&sender.history).put(&original, 42, 0, 0, StorageKind::AllowRetransmission);

        clock.set(100);
        sender.on_received_nack(&[42], 0);

        let packets = transport.sent_packets();
        assert_eq!(packets.len(), 1);
        let rtx = &packets[0];
        assert_eq!(rtx.len(), 18);
        assert_eq!(rtx[0], 0x80);
        assert_eq!(rtx[1], 0x65); // PT 101, no marker
        assert_eq!(&rtx[2..4], &[0x00, 0x05]); // RTX sequence number
        assert_eq!(&rtx[4..8], &original[4..8]); // timestamp untouched
        assert_eq!(&rtx[8..12], &[0x00, 0x00, 0x00, 0x0B]); // RTX SSRC
        assert_eq!(&rtx[12..14], &[0x00, 0x2A]); // OSN
        assert_eq!(&rtx[14..18], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let (_, rtx_stats) = sender.data_counters();
        assert_eq!(rtx_stats.packets, 1);
        assert_eq!(rtx_stats.retransmitted_packets, 1);
    }

    #[test]
    fn test_padding_gated_on_marker_bit() {
        let (sender, transport, _clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();

        // No frame sent yet: the last packet had no marker, rtx is off.
        assert_eq!(sender.time_to_send_padding(500), 0);
        assert!(transport.sent_packets().is_empty());

        // A sent frame ends with the marker bit, opening the gate.
        send_video_frame(&sender, &[0u8; 10]);
        let sent = sender.time_to_send_padding(100);
        assert_eq!(sent, MAX_PADDING_LENGTH);

        let packets = transport.sent_packets();
        assert_eq!(packets.len(), 2);
        let padding = &packets[1];
        let parsed = header::parse(padding).unwrap();
        assert!(parsed.padding);
        assert_eq!(padding[padding.len() - 1], MAX_PADDING_LENGTH as u8);
        assert_eq!(padding.len(), parsed.header_length + MAX_PADDING_LENGTH);
        assert!(!parsed.marker);
    }

    #[test]
    fn test_padding_rounds_up_to_full_packets() {
        let (sender, transport, _clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();
        send_video_frame(&sender, &[0u8; 10]);

        // 500 bytes of budget: two full runs plus a rounded-up remainder.
        assert_eq!(sender.time_to_send_padding(500), 3 * MAX_PADDING_LENGTH);
        assert_eq!(transport.sent_packets().len(), 1 + 3);
    }

    #[test]
    fn test_padding_over_rtx_needs_timing_reference() {
        let (sender, transport, _clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();
        sender.set_rtx_status(RTX_RETRANSMITTED);
        sender.set_rtx_payload_type(101);

        // No media sent and no abs-send-time registered: nothing to anchor
        // the receiver's estimator, so no padding.
        assert_eq!(sender.time_to_send_padding(100), 0);
        assert!(transport.sent_packets().is_empty());

        sender
            .register_rtp_header_extension(ExtensionKind::AbsoluteSendTime, 3)
            .unwrap();
        assert_eq!(sender.time_to_send_padding(100), MAX_PADDING_LENGTH);
        let packets = transport.sent_packets();
        assert_eq!(packets.len(), 1);
        let parsed = header::parse(&packets[0]).unwrap();
        assert_eq!(parsed.ssrc, sender.rtx_ssrc());
    }

    #[test]
    fn test_transport_failure_keeps_history_entry() {
        let (sender, transport, clock) = video_sender(1000);
        sender.register_payload("VP8", 96, 90_000, 0, 0).unwrap();
        sender.set_store_packets_status(true, 100);
        send_video_frame(&sender, &[1, 2, 3]);

        let seq = header::parse(&transport.sent_packets()[0])
            .unwrap()
            .sequence_number;

        transport.set_fail(true);
        clock.advance(50);
        sender.on_received_nack(&[seq], 0);
        assert_eq!(transport.sent_packets().len(), 1);

        // The entry is still there once the transport recovers.
        transport.set_fail(false);
        clock.advance(50);
        sender.on_received_nack(&[seq], 0);
        assert_eq!(transport.sent_packets().len(), 2);
    }

    #[test]
    fn test_ssrc_rotates_on_stop() {
        let (sender, _transport, _clock) = video_sender(1000);
        let old_ssrc = sender.ssrc();
        sender.set_sending_status(false);
        assert_ne!(sender.ssrc(), old_ssrc);
        assert_ne!(sender.ssrc(), 0);
    }

    #[test]
    fn test_forced_ssrc_survives_stop() {
        let (sender, _transport, _clock) = video_sender(1000);
        sender.set_ssrc(0x1234);
        sender.set_sending_status(false);
        assert_eq!(sender.ssrc(), 0x1234);
    }

    #[test]
    fn test_rtp_state_round_trip() {
        let (sender, _transport, _clock) = video_sender(1000);
        let state = RtpState {
            sequence_number: 100,
            start_timestamp: 9000,
            timestamp: 12_000,
            capture_time_ms: 500,
            last_timestamp_time_ms: 900,
            media_has_been_sent: true,
        };
        sender.set_rtp_state(state);
        assert_eq!(sender.rtp_state(), state);
        assert_eq!(sender.sequence_number(), 100);
        assert_eq!(sender.start_timestamp(), 9000);
    }

    #[test]
    fn test_audio_level_stamped_on_speech() {
        let clock = Arc::new(ManualClock::new(1000));
        let transport = Arc::new(MockTransport::default());
        let sender = RtpSender::new(
            1,
            true,
            clock,
            transport.clone(),
            None,
            Arc::new(SsrcRegistry::new()),
        );
        sender.register_payload("opus", 111, 48_000, 2, 0).unwrap();
        sender
            .register_rtp_header_extension(ExtensionKind::AudioLevel, 1)
            .unwrap();
        sender.set_audio_level(30).unwrap();

        sender
            .send_outgoing_data(FrameType::AudioSpeech, 111, 960, 10, &[1, 2], None)
            .unwrap();
        sender
            .send_outgoing_data(FrameType::AudioCn, 111, 1920, 20, &[3], None)
            .unwrap();

        let packets = transport.sent_packets();
        assert_eq!(packets.len(), 2);
        // Speech: marker set, voice bit set.
        let speech = header::parse(&packets[0]).unwrap();
        assert!(speech.marker);
        assert_eq!(packets[0][17], 0x80 | 30);
        // Comfort noise: no marker, no voice bit.
        let cn = header::parse(&packets[1]).unwrap();
        assert!(!cn.marker);
        assert_eq!(packets[1][17], 30);
    }

    #[test]
    fn test_max_data_payload_length_accounting() {
        let (sender, _transport, _clock) = video_sender(1000);
        assert_eq!(sender.max_data_payload_length(), 1472 - 12);

        sender.set_rtx_status(RTX_RETRANSMITTED);
        assert_eq!(sender.max_data_payload_length(), 1472 - 12 - 2);

        sender.set_generic_fec_status(true, 116, 117).unwrap();
        assert_eq!(sender.max_data_payload_length(), 1472 - 12 - 2 - 17);

        sender
            .register_rtp_header_extension(ExtensionKind::AbsoluteSendTime, 3)
            .unwrap();
        assert_eq!(sender.max_data_payload_length(), 1472 - 12 - 8 - 2 - 17);
    }

    #[test]
    fn test_mode_mismatched_config_rejected() {
        let (sender, _transport, _clock) = video_sender(1000);
        assert_eq!(sender.set_audio_level(10), Err(Error::ErrNotAudioSender));
        assert_eq!(
            sender.send_telephone_event(1, 100, 10),
            Err(Error::ErrNotAudioSender)
        );
        assert!(sender.set_generic_fec_status(true, 116, 117).is_ok());
    }
}
