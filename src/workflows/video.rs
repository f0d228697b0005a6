//! The video processing pipeline.
//!
//! Expressed purely against the engine's scheduling contract: transcode
//! (fan-out per bit rate inside a child orchestration), pick the best
//! rendition, extract a thumbnail, prepend the intro, ask a human for
//! approval, then publish or reject. Any failure along the way runs the
//! single cleanup path with whatever artifacts exist.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::core::{
    join_all, race, with_compensation, Compensation, DurableFuture, RaceWinner, WorkflowContext,
};
use crate::domain::{
    PipelineLocations, PipelineResult, TaskError, TranscodeRequest, VideoFileInfo,
    WorkflowFailure,
};

use super::{FnOrchestration, OrchestrationRegistry};

/// Orchestration names.
pub const PROCESS_VIDEO: &str = "O_ProcessVideo";
pub const TRANSCODE_VIDEO: &str = "O_TranscodeVideo";

/// Name of the approval signal the pipeline waits for.
pub const APPROVAL_EVENT: &str = "ApprovalResult";

/// Approval outcome recorded when the configured timeout expires first.
pub const APPROVAL_TIMED_OUT: &str = "TimedOut";

/// Activity names the pipeline schedules.
pub mod activities {
    pub const GET_TRANSCODE_BITRATES: &str = "A_GetTranscodeBitrates";
    pub const TRANSCODE_VIDEO: &str = "A_TranscodeVideo";
    pub const EXTRACT_THUMBNAIL: &str = "A_ExtractThumbnail";
    pub const PREPEND_INTRO: &str = "A_PrependIntro";
    pub const SEND_APPROVAL_REQUEST_EMAIL: &str = "A_SendApprovalRequestEmail";
    pub const PUBLISH_VIDEO: &str = "A_PublishVideo";
    pub const REJECT_VIDEO: &str = "A_RejectVideo";
    pub const CLEANUP: &str = "A_Cleanup";
}

// Artifact slots handed to cleanup, in pipeline order
const SLOT_TRANSCODED: usize = 0;
const SLOT_THUMBNAIL: usize = 1;
const SLOT_INTRO: usize = 2;

/// Pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct VideoPipelineSettings {
    /// How long to wait for an approval decision before treating the video
    /// as unapproved. `None` waits indefinitely.
    ///
    /// Changing this for an instance that is already awaiting approval
    /// changes its replay and is a determinism hazard, like any other
    /// decision-code change.
    pub approval_timeout: Option<Duration>,
}

/// Register the pipeline orchestrations.
pub fn register(registry: &mut OrchestrationRegistry, settings: VideoPipelineSettings) {
    registry.register(Arc::new(FnOrchestration::new(
        PROCESS_VIDEO,
        move |ctx, input| process_video(ctx, input, settings.clone()),
    )));
    registry.register(Arc::new(FnOrchestration::new(
        TRANSCODE_VIDEO,
        transcode_video,
    )));
}

/// Among all renditions, the numerically highest bit rate wins; ties go to
/// the earliest scheduled.
pub fn select_best_rendition(renditions: &[VideoFileInfo]) -> Option<&VideoFileInfo> {
    let mut best: Option<&VideoFileInfo> = None;
    for candidate in renditions {
        match best {
            Some(current) if candidate.bit_rate <= current.bit_rate => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Main pipeline orchestration.
async fn process_video(
    ctx: WorkflowContext,
    input: Value,
    settings: VideoPipelineSettings,
) -> Result<Value, WorkflowFailure> {
    let source = input.as_str().unwrap_or_default().to_string();
    let comp = Compensation::new(activities::CLEANUP, 3);

    let body = {
        let ctx = ctx.clone();
        let comp = comp.clone();
        async move {
            let renditions: Vec<VideoFileInfo> = ctx
                .schedule_sub_orchestration(TRANSCODE_VIDEO, json!(source))
                .into_typed()
                .await?;

            let best = select_best_rendition(&renditions)
                .cloned()
                .ok_or_else(|| TaskError::SubOrchestration {
                    orchestration: TRANSCODE_VIDEO.to_string(),
                    message: "no renditions produced".to_string(),
                })?;
            let transcoded = best.location;
            comp.record(SLOT_TRANSCODED, &transcoded);

            let thumbnail: String = ctx
                .schedule_activity(activities::EXTRACT_THUMBNAIL, json!(transcoded.clone()))
                .into_typed()
                .await?;
            comp.record(SLOT_THUMBNAIL, &thumbnail);

            let intro: String = ctx
                .schedule_activity(activities::PREPEND_INTRO, json!(transcoded.clone()))
                .into_typed()
                .await?;
            comp.record(SLOT_INTRO, &intro);

            let locations = PipelineLocations {
                transcoded_location: transcoded.clone(),
                thumbnail_location: thumbnail.clone(),
                intro_location: intro.clone(),
            };
            let locations_value = serde_json::to_value(&locations).unwrap_or(Value::Null);

            ctx.schedule_activity(
                activities::SEND_APPROVAL_REQUEST_EMAIL,
                locations_value.clone(),
            )
            .await?;

            let approval = await_approval(&ctx, &settings).await?;

            if approval == "Approved" {
                ctx.schedule_activity(activities::PUBLISH_VIDEO, locations_value)
                    .await?;
            } else {
                ctx.schedule_activity(activities::REJECT_VIDEO, locations_value)
                    .await?;
            }

            let result = PipelineResult {
                transcoded_location: transcoded,
                thumbnail_location: thumbnail,
                intro_location: intro,
                approval_result: approval,
            };
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
    };

    with_compensation(&ctx, &comp, body).await
}

/// Wait for the approval signal, optionally raced against a durable timer.
async fn await_approval(
    ctx: &WorkflowContext,
    settings: &VideoPipelineSettings,
) -> Result<String, TaskError> {
    let payload = match settings.approval_timeout {
        None => ctx.wait_for_event(APPROVAL_EVENT).await?,
        Some(timeout) => {
            let approval = ctx.wait_for_event(APPROVAL_EVENT);
            let deadline = ctx.create_timer(timeout);

            match race(approval, deadline).await? {
                RaceWinner::First(payload) => payload?,
                RaceWinner::Second(fired) => {
                    fired?;
                    return Ok(APPROVAL_TIMED_OUT.to_string());
                }
            }
        }
    };

    Ok(payload
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string()))
}

/// Child orchestration: enumerate target bit rates, fan out one transcode
/// per bit rate, fan in to the full rendition list.
async fn transcode_video(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowFailure> {
    let source = input.as_str().unwrap_or_default().to_string();
    let comp = Compensation::new(activities::CLEANUP, 0);

    let body = {
        let ctx = ctx.clone();
        let comp = comp.clone();
        async move {
            let bit_rates: Vec<u32> = ctx
                .schedule_activity(activities::GET_TRANSCODE_BITRATES, json!(source.clone()))
                .into_typed()
                .await?;

            let transcodes: Vec<DurableFuture> = bit_rates
                .iter()
                .map(|&bit_rate| {
                    let request = TranscodeRequest {
                        location: source.clone(),
                        bit_rate,
                    };
                    ctx.schedule_activity(
                        activities::TRANSCODE_VIDEO,
                        serde_json::to_value(&request).unwrap_or(Value::Null),
                    )
                })
                .collect();

            let results = match join_all(transcodes).await {
                Ok(results) => results,
                Err(failure) => {
                    // Renditions that finished before the failure get
                    // cleaned up; late finishers are recorded and ignored.
                    for (_, value) in &failure.completed {
                        if let Ok(info) = serde_json::from_value::<VideoFileInfo>(value.clone()) {
                            comp.push(info.location);
                        }
                    }
                    return Err(failure.error);
                }
            };

            let mut renditions = Vec::with_capacity(results.len());
            for value in results {
                let info: VideoFileInfo =
                    serde_json::from_value(value).map_err(|e| TaskError::Activity {
                        name: activities::TRANSCODE_VIDEO.to_string(),
                        message: format!("failed to decode rendition: {}", e),
                    })?;
                renditions.push(info);
            }

            Ok(serde_json::to_value(renditions).unwrap_or(Value::Null))
        }
    };

    with_compensation(&ctx, &comp, body).await
}
