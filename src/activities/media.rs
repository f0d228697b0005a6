//! Simulated media activities.
//!
//! Stand-ins for the real transcoders, mailers and publishers: they derive
//! output locations from their inputs without touching any media, which
//! keeps the pipeline runnable end-to-end. Swap in real implementations by
//! registering activities under the same names.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{PipelineLocations, TranscodeRequest, VideoFileInfo};
use crate::workflows::video::activities as names;

use super::{Activity, ActivityError, ActivityRegistry};

/// The standard set of video pipeline activities.
pub fn registry(bit_rates: Vec<u32>) -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    registry.register(Arc::new(GetTranscodeBitrates { bit_rates }));
    registry.register(Arc::new(TranscodeVideo));
    registry.register(Arc::new(ExtractThumbnail));
    registry.register(Arc::new(PrependIntro));
    registry.register(Arc::new(SendApprovalRequestEmail));
    registry.register(Arc::new(PublishVideo));
    registry.register(Arc::new(RejectVideo));
    registry.register(Arc::new(Cleanup));
    registry
}

fn decode<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ActivityError> {
    serde_json::from_value(input).map_err(|e| ActivityError::Business(format!("bad input: {}", e)))
}

/// Strip the extension off a location to build derived names.
fn stem(location: &str) -> &str {
    location.rsplit_once('.').map(|(s, _)| s).unwrap_or(location)
}

/// Enumerates the target bit rates for a source video.
pub struct GetTranscodeBitrates {
    pub bit_rates: Vec<u32>,
}

#[async_trait]
impl Activity for GetTranscodeBitrates {
    fn name(&self) -> &str {
        names::GET_TRANSCODE_BITRATES
    }

    async fn execute(&self, _input: Value) -> Result<Value, ActivityError> {
        Ok(json!(self.bit_rates))
    }
}

/// Produces one rendition of the source at the requested bit rate.
pub struct TranscodeVideo;

#[async_trait]
impl Activity for TranscodeVideo {
    fn name(&self) -> &str {
        names::TRANSCODE_VIDEO
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let request: TranscodeRequest = decode(input)?;
        let info = VideoFileInfo {
            location: format!("{}-{}kbps.mp4", stem(&request.location), request.bit_rate),
            bit_rate: request.bit_rate,
        };
        debug!(location = %info.location, "Transcoded rendition");
        Ok(serde_json::to_value(info).unwrap_or(Value::Null))
    }
}

pub struct ExtractThumbnail;

#[async_trait]
impl Activity for ExtractThumbnail {
    fn name(&self) -> &str {
        names::EXTRACT_THUMBNAIL
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let location: String = decode(input)?;
        Ok(json!(format!("{}-thumbnail.png", stem(&location))))
    }
}

pub struct PrependIntro;

#[async_trait]
impl Activity for PrependIntro {
    fn name(&self) -> &str {
        names::PREPEND_INTRO
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let location: String = decode(input)?;
        Ok(json!(format!("{}-with-intro.mp4", stem(&location))))
    }
}

/// Pretends to notify an approver that a video is ready for review.
pub struct SendApprovalRequestEmail;

#[async_trait]
impl Activity for SendApprovalRequestEmail {
    fn name(&self) -> &str {
        names::SEND_APPROVAL_REQUEST_EMAIL
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let locations: PipelineLocations = decode(input)?;
        info!(video = %locations.intro_location, "Approval request sent");
        Ok(Value::Null)
    }
}

pub struct PublishVideo;

#[async_trait]
impl Activity for PublishVideo {
    fn name(&self) -> &str {
        names::PUBLISH_VIDEO
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let locations: PipelineLocations = decode(input)?;
        info!(video = %locations.intro_location, "Video published");
        Ok(Value::Null)
    }
}

pub struct RejectVideo;

#[async_trait]
impl Activity for RejectVideo {
    fn name(&self) -> &str {
        names::REJECT_VIDEO
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let locations: PipelineLocations = decode(input)?;
        info!(video = %locations.intro_location, "Video rejected");
        Ok(Value::Null)
    }
}

/// Removes intermediate artifacts after a failed run. Tolerant of absent
/// entries: steps never reached show up as nulls.
pub struct Cleanup;

#[async_trait]
impl Activity for Cleanup {
    fn name(&self) -> &str {
        names::CLEANUP
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let locations: Vec<Option<String>> = decode(input)?;
        for location in locations.into_iter().flatten() {
            info!(%location, "Cleaned up intermediate file");
        }
        Ok(Value::Null)
    }
}
