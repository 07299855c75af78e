//! # Aerolink Wire Format
//!
//! Radio application packets as delivered by the (external) radio transport
//! after CRC check and decryption, and the control packets the station sends
//! back to the vehicle.
//!
//! ## Common header (5 bytes)
//!
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |      Stream Packet Index (32)      |
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! ## Video data header (28 bytes, follows the common header)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Block Index (32)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Packet Index  |  Data Count   |   FEC Count   |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Packet Length (16)      |    Profile    | Enc Flags ... |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... (16)      |     Width (16)                |  Height ...   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | ... (16)      |      FPS      |  Keyframe ms (16)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Video Bitrate bps (32)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Retransmission Request Id (32)                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload (`Packet Length` bytes) follows the video header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest radio packet the transport delivers.
pub const MAX_PACKET_TOTAL_SIZE: usize = 1500;

/// Common header size: type (1) + stream packet index (4).
pub const COMMON_HEADER_SIZE: usize = 5;

/// Video header size (after the common header).
pub const VIDEO_HEADER_SIZE: usize = 28;

/// Largest video payload carried by one packet.
pub const MAX_VIDEO_PAYLOAD: usize = 1400;

/// Maximum data + FEC packets in one block.
pub const MAX_TOTAL_PACKETS_IN_BLOCK: usize = 64;

/// Hard limit of segments in one retransmission request packet.
pub const MAX_RETRANSMISSION_PACKETS_IN_REQUEST: usize = 30;

/// Video header flag: packet is a retransmission answering a request.
pub const VIDEO_FLAG_RETRANSMITTED: u8 = 0x01;
/// Video header flag: the vehicle listens for uplink after this block.
pub const VIDEO_FLAG_CAN_TX: u8 = 0x02;

/// Encoding flag: retransmissions enabled for the stream.
pub const ENCODING_RETRANSMISSIONS: u16 = 0x0001;
/// Encoding flag: adaptive video quality enabled.
pub const ENCODING_ADAPTIVE_VIDEO: u16 = 0x0002;
/// Encoding flag: adaptive keyframe interval enabled.
pub const ENCODING_ADAPTIVE_KEYFRAME: u16 = 0x0004;
/// Encoding flag: fixed one-way link (no uplink at all).
pub const ENCODING_ONE_WAY_LINK: u16 = 0x0008;
/// Encoding flag: adapt only between the high and medium profiles.
pub const ENCODING_MEDIUM_ADAPTIVE_ONLY: u16 = 0x0010;
/// Encoding flags bits carrying the retransmission window, in 5 ms units.
pub const ENCODING_RETRANSMISSION_WINDOW_MASK: u16 = 0xFF00;

/// Retransmission window in milliseconds encoded in the stream flags.
#[inline]
pub fn retransmission_window_ms(encoding_flags: u16) -> u32 {
    (((encoding_flags & ENCODING_RETRANSMISSION_WINDOW_MASK) >> 8) as u32) * 5
}

/// Build encoding flags from feature bits and a window in milliseconds.
pub fn encoding_flags_with_window(features: u16, window_ms: u32) -> u16 {
    let units = (window_ms / 5).min(0xFF) as u16;
    (features & !ENCODING_RETRANSMISSION_WINDOW_MASK) | (units << 8)
}

// ─── Packet Type ─────────────────────────────────────────────────────────────

/// Radio packet types handled by the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    VideoData = 0x10,
    RequestSegments = 0x20,
    SwitchVideoLevel = 0x21,
    SwitchVideoLevelAck = 0x22,
    SwitchKeyframe = 0x23,
    SwitchKeyframeAck = 0x24,
    Ping = 0x30,
    PingReply = 0x31,
    Command = 0x40,
    PairingRequest = 0x41,
    NegotiateRadioLinks = 0x42,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(PacketType::VideoData),
            0x20 => Some(PacketType::RequestSegments),
            0x21 => Some(PacketType::SwitchVideoLevel),
            0x22 => Some(PacketType::SwitchVideoLevelAck),
            0x23 => Some(PacketType::SwitchKeyframe),
            0x24 => Some(PacketType::SwitchKeyframeAck),
            0x30 => Some(PacketType::Ping),
            0x31 => Some(PacketType::PingReply),
            0x40 => Some(PacketType::Command),
            0x41 => Some(PacketType::PairingRequest),
            0x42 => Some(PacketType::NegotiateRadioLinks),
            _ => None,
        }
    }

    /// Peek the packet type of a serialized packet without decoding it.
    pub fn peek(data: &[u8]) -> Option<Self> {
        data.first().and_then(|&b| Self::from_u8(b))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::VideoData => "video-data",
            PacketType::RequestSegments => "request-segments",
            PacketType::SwitchVideoLevel => "switch-video-level",
            PacketType::SwitchVideoLevelAck => "switch-video-level-ack",
            PacketType::SwitchKeyframe => "switch-keyframe",
            PacketType::SwitchKeyframeAck => "switch-keyframe-ack",
            PacketType::Ping => "ping",
            PacketType::PingReply => "ping-reply",
            PacketType::Command => "command",
            PacketType::PairingRequest => "pairing-request",
            PacketType::NegotiateRadioLinks => "negotiate-radio-links",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overwrite the stream packet index of an already serialized packet.
///
/// The uplink writer stamps indices at send time, after queueing.
pub fn stamp_stream_packet_index(buf: &mut [u8], index: u32) -> bool {
    if buf.len() < COMMON_HEADER_SIZE {
        return false;
    }
    buf[1..COMMON_HEADER_SIZE].copy_from_slice(&index.to_be_bytes());
    true
}

// ─── Video Profile ───────────────────────────────────────────────────────────

/// Video link profile the vehicle is currently encoding with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum VideoProfile {
    /// User-selected, highest quality profile.
    #[default]
    High = 0,
    Medium = 1,
    Low = 2,
}

impl VideoProfile {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(VideoProfile::High),
            1 => Some(VideoProfile::Medium),
            2 => Some(VideoProfile::Low),
            _ => None,
        }
    }
}

// ─── Video Header ────────────────────────────────────────────────────────────

/// FEC coding scheme of a block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockScheme {
    pub packet_length: u16,
    pub data_packets: u8,
    pub fec_packets: u8,
}

impl BlockScheme {
    pub fn new(packet_length: u16, data_packets: u8, fec_packets: u8) -> Self {
        BlockScheme {
            packet_length,
            data_packets,
            fec_packets,
        }
    }

    /// Total packets (data + FEC) in a block of this scheme.
    #[inline]
    pub fn total_packets(&self) -> usize {
        self.data_packets as usize + self.fec_packets as usize
    }

    /// Whether the scheme fits the block arena and payload limits.
    pub fn is_valid(&self) -> bool {
        self.data_packets > 0
            && self.total_packets() <= MAX_TOTAL_PACKETS_IN_BLOCK
            && self.packet_length > 0
            && self.packet_length as usize <= MAX_VIDEO_PAYLOAD
    }
}

/// Header of a video data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHeader {
    pub block_index: u32,
    pub packet_index: u8,
    pub scheme: BlockScheme,
    pub flags: u8,
    pub profile: VideoProfile,
    pub encoding_flags: u16,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub keyframe_ms: u16,
    pub video_bitrate_bps: u32,
    /// Request this packet answers; only meaningful when retransmitted.
    pub request_id: u32,
}

impl VideoHeader {
    pub fn new(block_index: u32, packet_index: u8, scheme: BlockScheme) -> Self {
        VideoHeader {
            block_index,
            packet_index,
            scheme,
            flags: 0,
            profile: VideoProfile::High,
            encoding_flags: 0,
            width: 1280,
            height: 720,
            fps: 30,
            keyframe_ms: 0,
            video_bitrate_bps: 0,
            request_id: 0,
        }
    }

    #[inline]
    pub fn is_retransmitted(&self) -> bool {
        self.flags & VIDEO_FLAG_RETRANSMITTED != 0
    }

    #[inline]
    pub fn can_tx(&self) -> bool {
        self.flags & VIDEO_FLAG_CAN_TX != 0
    }

    #[inline]
    pub fn is_data_packet(&self) -> bool {
        self.packet_index < self.scheme.data_packets
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.block_index);
        buf.put_u8(self.packet_index);
        buf.put_u8(self.scheme.data_packets);
        buf.put_u8(self.scheme.fec_packets);
        buf.put_u8(self.flags);
        buf.put_u16(self.scheme.packet_length);
        buf.put_u8(self.profile as u8);
        buf.put_u16(self.encoding_flags);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_u8(self.fps);
        buf.put_u16(self.keyframe_ms);
        buf.put_u32(self.video_bitrate_bps);
        buf.put_u32(self.request_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < VIDEO_HEADER_SIZE {
            return None;
        }
        let block_index = buf.get_u32();
        let packet_index = buf.get_u8();
        let data_packets = buf.get_u8();
        let fec_packets = buf.get_u8();
        let flags = buf.get_u8();
        let packet_length = buf.get_u16();
        let profile = VideoProfile::from_u8(buf.get_u8())?;
        Some(VideoHeader {
            block_index,
            packet_index,
            scheme: BlockScheme {
                packet_length,
                data_packets,
                fec_packets,
            },
            flags,
            profile,
            encoding_flags: buf.get_u16(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            fps: buf.get_u8(),
            keyframe_ms: buf.get_u16(),
            video_bitrate_bps: buf.get_u32(),
            request_id: buf.get_u32(),
        })
    }
}

/// A video data (or FEC) packet with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacket {
    pub header: VideoHeader,
    pub payload: Bytes,
}

// ─── Retransmission Request ──────────────────────────────────────────────────

/// One `(block, packet, retry)` tuple of a retransmission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RequestedSegment {
    pub block_index: u32,
    pub packet_index: u8,
    pub retry_count: u8,
}

/// Request for N video segments: `[u32 id][u8 stream][u8 count]` + tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub request_id: u32,
    pub stream: u8,
    pub segments: Vec<RequestedSegment>,
}

impl SegmentRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        let count = self
            .segments
            .len()
            .min(MAX_RETRANSMISSION_PACKETS_IN_REQUEST);
        buf.put_u32(self.request_id);
        buf.put_u8(self.stream);
        buf.put_u8(count as u8);
        for seg in &self.segments[..count] {
            buf.put_u32(seg.block_index);
            buf.put_u8(seg.packet_index);
            buf.put_u8(seg.retry_count);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 6 {
            return None;
        }
        let request_id = buf.get_u32();
        let stream = buf.get_u8();
        let count = buf.get_u8() as usize;
        if count > MAX_RETRANSMISSION_PACKETS_IN_REQUEST || buf.remaining() < count * 6 {
            return None;
        }
        let segments = (0..count)
            .map(|_| RequestedSegment {
                block_index: buf.get_u32(),
                packet_index: buf.get_u8(),
                retry_count: buf.get_u8(),
            })
            .collect();
        Some(SegmentRequest {
            request_id,
            stream,
            segments,
        })
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A decoded radio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Video(VideoPacket),
    RequestSegments(SegmentRequest),
    SwitchVideoLevel { level: u32, stream: u8 },
    VideoLevelAck { level: u32 },
    SwitchKeyframe { keyframe_ms: u32, stream: u8 },
    KeyframeAck { keyframe_ms: u32 },
    /// Station keepalive; the vehicle echoes the id back.
    Ping { ping_id: u8 },
    PingReply { ping_id: u8 },
    /// Packet types the station routes but does not interpret.
    Opaque { packet_type: PacketType, body: Bytes },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Video(_) => PacketType::VideoData,
            Packet::RequestSegments(_) => PacketType::RequestSegments,
            Packet::SwitchVideoLevel { .. } => PacketType::SwitchVideoLevel,
            Packet::VideoLevelAck { .. } => PacketType::SwitchVideoLevelAck,
            Packet::SwitchKeyframe { .. } => PacketType::SwitchKeyframe,
            Packet::KeyframeAck { .. } => PacketType::SwitchKeyframeAck,
            Packet::Ping { .. } => PacketType::Ping,
            Packet::PingReply { .. } => PacketType::PingReply,
            Packet::Opaque { packet_type, .. } => *packet_type,
        }
    }

    /// Serialize with the given stream packet index.
    pub fn encode(&self, stream_packet_index: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u32(stream_packet_index);
        match self {
            Packet::Video(v) => {
                buf.reserve(VIDEO_HEADER_SIZE + v.payload.len());
                v.header.encode(&mut buf);
                buf.put_slice(&v.payload);
            }
            Packet::RequestSegments(req) => req.encode(&mut buf),
            Packet::SwitchVideoLevel { level, stream } => {
                buf.put_u32(*level);
                buf.put_u8(*stream);
            }
            Packet::VideoLevelAck { level } => buf.put_u32(*level),
            Packet::SwitchKeyframe {
                keyframe_ms,
                stream,
            } => {
                buf.put_u32(*keyframe_ms);
                buf.put_u8(*stream);
            }
            Packet::KeyframeAck { keyframe_ms } => buf.put_u32(*keyframe_ms),
            Packet::Ping { ping_id } | Packet::PingReply { ping_id } => buf.put_u8(*ping_id),
            Packet::Opaque { body, .. } => buf.put_slice(body),
        }
        buf
    }

    /// Decode a packet, returning its stream packet index alongside.
    pub fn decode(buf: &mut Bytes) -> Option<(u32, Packet)> {
        if buf.len() < COMMON_HEADER_SIZE || buf.len() > MAX_PACKET_TOTAL_SIZE {
            return None;
        }
        let packet_type = PacketType::from_u8(buf.get_u8())?;
        let stream_packet_index = buf.get_u32();

        let packet = match packet_type {
            PacketType::VideoData => {
                let header = VideoHeader::decode(buf)?;
                let len = header.scheme.packet_length as usize;
                if buf.remaining() < len {
                    return None;
                }
                let payload = buf.split_to(len);
                Packet::Video(VideoPacket { header, payload })
            }
            PacketType::RequestSegments => Packet::RequestSegments(SegmentRequest::decode(buf)?),
            PacketType::SwitchVideoLevel => {
                if buf.remaining() < 5 {
                    return None;
                }
                Packet::SwitchVideoLevel {
                    level: buf.get_u32(),
                    stream: buf.get_u8(),
                }
            }
            PacketType::SwitchVideoLevelAck => {
                if buf.remaining() < 4 {
                    return None;
                }
                Packet::VideoLevelAck {
                    level: buf.get_u32(),
                }
            }
            PacketType::SwitchKeyframe => {
                if buf.remaining() < 5 {
                    return None;
                }
                Packet::SwitchKeyframe {
                    keyframe_ms: buf.get_u32(),
                    stream: buf.get_u8(),
                }
            }
            PacketType::SwitchKeyframeAck => {
                if buf.remaining() < 4 {
                    return None;
                }
                Packet::KeyframeAck {
                    keyframe_ms: buf.get_u32(),
                }
            }
            PacketType::Ping | PacketType::PingReply => {
                if buf.remaining() < 1 {
                    return None;
                }
                let ping_id = buf.get_u8();
                if packet_type == PacketType::Ping {
                    Packet::Ping { ping_id }
                } else {
                    Packet::PingReply { ping_id }
                }
            }
            other => Packet::Opaque {
                packet_type: other,
                body: buf.split_to(buf.len()),
            },
        };
        Some((stream_packet_index, packet))
    }
}
