//! Value types exchanged with the video pipeline activities.

use serde::{Deserialize, Serialize};

/// A rendition produced by a transcode activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFileInfo {
    /// Where the rendition was written
    pub location: String,

    /// Bit rate in kbps
    pub bit_rate: u32,
}

/// Input to a single transcode activity call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeRequest {
    pub location: String,
    pub bit_rate: u32,
}

/// The artifact locations produced by the pipeline, handed to the
/// notification, publish and reject activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLocations {
    pub transcoded_location: String,
    pub thumbnail_location: String,
    pub intro_location: String,
}

/// Successful pipeline output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub transcoded_location: String,
    pub thumbnail_location: String,
    pub intro_location: String,

    /// Literal payload of the approval event ("Approved", "Rejected", ...)
    pub approval_result: String,
}
