//! # Adaptive Controllers
//!
//! Two periodic control loops driven by the station tick (20 ms): one moves
//! the video quality level, the other the keyframe interval. Both read the
//! [`AdaptiveIntervalHistory`] the reliability pipeline fills, both push
//! their requests to the head of the outbound queue and resend them until
//! the vehicle acknowledges.
//!
//! ## Modules
//!
//! - [`thresholds`]: pure threshold arithmetic
//! - [`quality`]: video quality level controller
//! - [`keyframe`]: keyframe interval controller

use quanta::Instant;

use aerolink_transport::history::AdaptiveIntervalHistory;
use aerolink_transport::receiver::StreamInfo;

pub mod keyframe;
pub mod quality;
pub mod thresholds;

pub use keyframe::{KeyframeConfig, KeyframeController, KeyframeStatus};
pub use quality::{QualityConfig, QualityController, QualityState, QualityStatus};

/// What a controller tick reads from the pipeline.
///
/// The history is borrowed mutably so accepted shifts can be flagged in
/// the open interval.
pub struct ControllerInput<'a> {
    pub history: &'a mut AdaptiveIntervalHistory,
    pub stream: Option<&'a StreamInfo>,
    pub last_video_packet_at: Option<Instant>,
    /// No video from the vehicle for the link-lost timeout.
    pub link_lost: bool,
}
