//! Registered payload types and the frame classes the sender accepts.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// RTP timestamp frequency used by all video payloads.
pub const VIDEO_PAYLOAD_TYPE_FREQUENCY: u32 = 90_000;

/// Frame classes accepted by `send_outgoing_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Empty,
    AudioSpeech,
    AudioCn,
    VideoKey,
    VideoDelta,
}

impl FrameType {
    pub fn is_audio(self) -> bool {
        matches!(self, FrameType::AudioSpeech | FrameType::AudioCn)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FrameType::Empty => "empty",
            FrameType::AudioSpeech => "audio_speech",
            FrameType::AudioCn => "audio_cn",
            FrameType::VideoKey => "video_key",
            FrameType::VideoDelta => "video_delta",
        }
    }
}

/// Packetization boundaries produced by an encoder: parallel offset/length
/// pairs into the frame payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FragmentationHeader {
    pub offsets: Vec<usize>,
    pub lengths: Vec<usize>,
}

/// Video codecs the sender can carry. Anything unrecognized packetizes
/// generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    Generic,
    Vp8,
    H264,
}

impl VideoCodec {
    fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("VP8") {
            VideoCodec::Vp8
        } else if name.eq_ignore_ascii_case("H264") {
            VideoCodec::H264
        } else {
            VideoCodec::Generic
        }
    }
}

/// Media-specific parameters of a registered payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    Audio {
        frequency: u32,
        channels: u8,
        rate: u32,
    },
    Video {
        codec: VideoCodec,
        max_rate: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub kind: PayloadKind,
}

impl Payload {
    pub fn is_audio(&self) -> bool {
        matches!(self.kind, PayloadKind::Audio { .. })
    }
}

/// Table of payload number -> descriptor for one sender.
#[derive(Debug, Default)]
pub struct PayloadRegistry {
    payloads: HashMap<i8, Payload>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type. Re-registering the same name with matching
    /// parameters is accepted (an audio rate of 0 on either side is treated
    /// as unset and refreshed); anything else under an existing number is a
    /// collision.
    pub fn register(
        &mut self,
        audio_configured: bool,
        name: &str,
        payload_type: i8,
        frequency: u32,
        channels: u8,
        rate: u32,
    ) -> Result<()> {
        if payload_type < 0 {
            return Err(Error::ErrInvalidPayloadType);
        }
        if let Some(existing) = self.payloads.get_mut(&payload_type) {
            if existing.name.eq_ignore_ascii_case(name) {
                match &mut existing.kind {
                    PayloadKind::Audio {
                        frequency: existing_frequency,
                        rate: existing_rate,
                        ..
                    } if audio_configured => {
                        if *existing_frequency == frequency
                            && (*existing_rate == rate || *existing_rate == 0 || rate == 0)
                        {
                            // Refresh the rate if either side left it unset.
                            *existing_rate = rate;
                            return Ok(());
                        }
                    }
                    PayloadKind::Video { .. } if !audio_configured => {
                        return Ok(());
                    }
                    _ => {}
                }
            }
            return Err(Error::ErrPayloadTypeCollision);
        }

        let kind = if audio_configured {
            PayloadKind::Audio {
                frequency,
                channels,
                rate,
            }
        } else {
            PayloadKind::Video {
                codec: VideoCodec::from_name(name),
                max_rate: rate,
            }
        };
        self.payloads.insert(
            payload_type,
            Payload {
                name: name.to_owned(),
                kind,
            },
        );
        Ok(())
    }

    pub fn deregister(&mut self, payload_type: i8) -> Result<()> {
        self.payloads
            .remove(&payload_type)
            .map(|_| ())
            .ok_or(Error::ErrUnknownPayloadType)
    }

    pub fn get(&self, payload_type: i8) -> Option<&Payload> {
        self.payloads.get(&payload_type)
    }
}
