//! Video packetizer: splits encoded frames across packets, carries the FEC
//! configuration used for packet classification, and decides which frames
//! stay retransmittable.

use crate::error::{Error, Result};
use crate::history::StorageKind;
use crate::pacer::PacketPriority;
use crate::payload::{FragmentationHeader, FrameType, VideoCodec};
use crate::sender::PacketPlan;

pub const RETRANSMIT_OFF: u8 = 0x00;
pub const RETRANSMIT_FEC_PACKETS: u8 = 0x01;
pub const RETRANSMIT_BASE_LAYER: u8 = 0x02;
pub const RETRANSMIT_HIGHER_LAYERS: u8 = 0x04;

const RED_HEADER_LENGTH: usize = 1;
const FEC_HEADER_LENGTH: usize = 10;
const ULP_HEADER_LENGTH: usize = 6;

/// ULPFEC protection levels, kept for the FEC producer living above this
/// sender. The core only stores them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FecProtectionParams {
    pub fec_rate: u8,
    pub use_uep_protection: bool,
    pub max_fec_frames: u8,
}

pub struct VideoSender {
    codec: VideoCodec,
    max_configured_bitrate: u32,
    fec_enabled: bool,
    red_payload_type: u8,
    fec_payload_type: u8,
    delta_fec_params: FecProtectionParams,
    key_fec_params: FecProtectionParams,
    retransmission_settings: u8,
}

impl VideoSender {
    pub(crate) fn new() -> Self {
        VideoSender {
            codec: VideoCodec::Generic,
            max_configured_bitrate: 0,
            fec_enabled: false,
            red_payload_type: 0,
            fec_payload_type: 0,
            delta_fec_params: FecProtectionParams::default(),
            key_fec_params: FecProtectionParams::default(),
            retransmission_settings: RETRANSMIT_BASE_LAYER | RETRANSMIT_HIGHER_LAYERS,
        }
    }

    pub(crate) fn set_codec(&mut self, codec: VideoCodec) {
        self.codec = codec;
    }

    pub(crate) fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub(crate) fn set_max_configured_bitrate(&mut self, bitrate: u32) {
        self.max_configured_bitrate = bitrate;
    }

    pub(crate) fn max_configured_bitrate(&self) -> u32 {
        self.max_configured_bitrate
    }

    pub(crate) fn set_generic_fec_status(
        &mut self,
        enabled: bool,
        red_payload_type: u8,
        fec_payload_type: u8,
    ) {
        self.fec_enabled = enabled;
        self.red_payload_type = red_payload_type;
        self.fec_payload_type = fec_payload_type;
    }

    pub(crate) fn generic_fec_status(&self) -> (bool, u8, u8) {
        (self.fec_enabled, self.red_payload_type, self.fec_payload_type)
    }

    pub(crate) fn set_fec_parameters(
        &mut self,
        delta_params: FecProtectionParams,
        key_params: FecProtectionParams,
    ) {
        self.delta_fec_params = delta_params;
        self.key_fec_params = key_params;
    }

    pub(crate) fn fec_parameters(&self) -> (FecProtectionParams, FecProtectionParams) {
        (self.delta_fec_params, self.key_fec_params)
    }

    pub(crate) fn set_selective_retransmissions(&mut self, settings: u8) {
        self.retransmission_settings = settings;
    }

    pub(crate) fn selective_retransmissions(&self) -> u8 {
        self.retransmission_settings
    }

    /// Bytes the RED + ULPFEC encapsulation would add to each packet when
    /// FEC is enabled; reserved out of the payload budget.
    pub(crate) fn fec_packet_overhead(&self) -> usize {
        if self.fec_enabled {
            RED_HEADER_LENGTH + FEC_HEADER_LENGTH + ULP_HEADER_LENGTH
        } else {
            0
        }
    }

    fn storage_for(&self, frame_type: FrameType) -> StorageKind {
        let wanted = match frame_type {
            FrameType::VideoKey => RETRANSMIT_BASE_LAYER,
            _ => RETRANSMIT_HIGHER_LAYERS,
        };
        if self.retransmission_settings & wanted != 0 {
            StorageKind::AllowRetransmission
        } else {
            StorageKind::DontStore
        }
    }

    /// Splits one encoded frame into packet plans of at most
    /// `max_payload_length` bytes each, breaking at fragmentation boundaries
    /// when the encoder provided them. The marker bit goes on the last
    /// packet of the frame.
    pub(crate) fn packetize(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        fragmentation: Option<&FragmentationHeader>,
        max_payload_length: usize,
    ) -> Result<Vec<PacketPlan>> {
        if frame_type.is_audio() {
            return Err(Error::ErrInvalidFrameType);
        }
        if payload.is_empty() || max_payload_length == 0 {
            return Ok(vec![]);
        }

        let priority = if frame_type == FrameType::VideoKey {
            PacketPriority::High
        } else {
            PacketPriority::Normal
        };
        let storage = self.storage_for(frame_type);

        let mut chunks: Vec<&[u8]> = Vec::new();
        match fragmentation {
            Some(fragmentation) if !fragmentation.offsets.is_empty() => {
                if fragmentation.offsets.len() != fragmentation.lengths.len() {
                    return Err(Error::ErrInvalidFragmentation);
                }
                for (&offset, &length) in fragmentation
                    .offsets
                    .iter()
                    .zip(fragmentation.lengths.iter())
                {
                    let end = offset.checked_add(length).ok_or(Error::ErrInvalidFragmentation)?;
                    if end > payload.len() {
                        return Err(Error::ErrInvalidFragmentation);
                    }
                    for chunk in payload[offset..end].chunks(max_payload_length) {
                        chunks.push(chunk);
                    }
                }
            }
            _ => {
                chunks.extend(payload.chunks(max_payload_length));
            }
        }

        if chunks.is_empty() {
            return Ok(vec![]);
        }
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| PacketPlan {
                payload: chunk.to_vec(),
                marker: i == last,
                priority,
                storage,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_marker_on_last() {
        let mut video = VideoSender::new();
        let payload = vec![0u8; 2500];
        let plans = video
            .packetize(FrameType::VideoDelta, &payload, None, 1000)
            .unwrap();

        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].payload.len(), 1000);
        assert_eq!(plans[2].payload.len(), 500);
        assert!(!plans[0].marker);
        assert!(!plans[1].marker);
        assert!(plans[2].marker);
    }

    #[test]
    fn test_key_frames_are_high_priority() {
        let mut video = VideoSender::new();
        let key = video
            .packetize(FrameType::VideoKey, &[0u8; 10], None, 1000)
            .unwrap();
        let delta = video
            .packetize(FrameType::VideoDelta, &[0u8; 10], None, 1000)
            .unwrap();
        assert_eq!(key[0].priority, PacketPriority::High);
        assert_eq!(delta[0].priority, PacketPriority::Normal);
    }

    #[test]
    fn test_fragmentation_boundaries_respected() {
        let mut video = VideoSender::new();
        let payload: Vec<u8> = (0..100).collect();
        let fragmentation = FragmentationHeader {
            offsets: vec![0, 60],
            lengths: vec![60, 40],
        };
        let plans = video
            .packetize(FrameType::VideoDelta, &payload, Some(&fragmentation), 50)
            .unwrap();

        // First fragment splits into 50 + 10, second fits whole.
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].payload, payload[0..50]);
        assert_eq!(plans[1].payload, payload[50..60]);
        assert_eq!(plans[2].payload, payload[60..100]);
        assert!(plans[2].marker);
    }

    #[test]
    fn test_bad_fragmentation_rejected() {
        let mut video = VideoSender::new();
        let fragmentation = FragmentationHeader {
            offsets: vec![90],
            lengths: vec![20],
        };
        assert_eq!(
            video.packetize(FrameType::VideoDelta, &[0u8; 100], Some(&fragmentation), 50),
            Err(Error::ErrInvalidFragmentation)
        );
    }

    #[test]
    fn test_selective_retransmissions_drive_storage() {
        let mut video = VideoSender::new();
        video.set_selective_retransmissions(RETRANSMIT_BASE_LAYER);

        let key = video
            .packetize(FrameType::VideoKey, &[0u8; 10], None, 1000)
            .unwrap();
        let delta = video
            .packetize(FrameType::VideoDelta, &[0u8; 10], None, 1000)
            .unwrap();
        assert_eq!(key[0].storage, StorageKind::AllowRetransmission);
        assert_eq!(delta[0].storage, StorageKind::DontStore);
    }

    #[test]
    fn test_fec_overhead() {
        let mut video = VideoSender::new();
        assert_eq!(video.fec_packet_overhead(), 0);
        video.set_generic_fec_status(true, 116, 117);
        assert_eq!(video.fec_packet_overhead(), 17);
        assert_eq!(video.generic_fec_status(), (true, 116, 117));
    }

    #[test]
    fn test_audio_frame_type_rejected() {
        let mut video = VideoSender::new();
        assert_eq!(
            video.packetize(FrameType::AudioSpeech, &[0], None, 1000),
            Err(Error::ErrInvalidFrameType)
        );
    }
}
