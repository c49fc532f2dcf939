//! Rollout scoring for the `video_grounding` reward.
//!
//! A response earns a format bonus for a parseable grounding (scaled by how much
//! reasoning precedes it), a localization term against the annotated interval,
//! and loses a bounded penalty for implausible sampling rates. Anything that
//! cannot be parsed scores exactly zero.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::alignment::overlap;
use crate::grounding::{GroundingAnswer, GroundingParser, ParseError};
use crate::segment::{SegmentAddress, TimeInterval, segment_count, validate_duration};
use crate::video::VideoMeta;

pub const VIDEO_GROUNDING: &str = "video_grounding";
pub const VIDEO_GROUNDING_SEGMENT: &str = "video_grounding_segment";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizationMode {
    /// IoU between the predicted segment and the raw annotated interval.
    #[default]
    Iou,
    /// Distance between the predicted and the stored canonical segment.
    Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub format_weight: f64,
    pub reasoning_share: f64,
    pub reasoning_target_chars: usize,
    pub localization_weight: f64,
    pub rate_weight: f64,
    pub min_rate: f64,
    pub localization: LocalizationMode,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            format_weight: 0.3,
            reasoning_share: 0.4,
            reasoning_target_chars: 200,
            localization_weight: 0.7,
            rate_weight: 0.2,
            min_rate: 0.5,
            localization: LocalizationMode::Iou,
        }
    }
}

impl RewardConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("format_weight", self.format_weight),
            ("localization_weight", self.localization_weight),
            ("rate_weight", self.rate_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} must be a non-negative number, got {value}");
            }
        }
        if !(0.0..=1.0).contains(&self.reasoning_share) {
            bail!(
                "reasoning_share must be within [0, 1], got {}",
                self.reasoning_share
            );
        }
        if !self.min_rate.is_finite() || self.min_rate <= 0.0 {
            bail!("min_rate must be positive, got {}", self.min_rate);
        }
        Ok(())
    }
}

/// The slice of a training record a rollout is scored against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingTarget {
    pub video_id: String,
    pub interval: TimeInterval,
    pub canonical: SegmentAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum ScoreFailure {
    #[error("unparseable response: {0}")]
    Parse(ParseError),

    #[error("record for video {record_video} does not match scorer metadata for {metadata_video}: {detail}")]
    DurationMismatch {
        record_video: String,
        metadata_video: String,
        detail: String,
    },
}

impl ScoreFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(err) => err.kind.code(),
            Self::DurationMismatch { .. } => "duration_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardResult {
    pub reward: f64,
    pub format_ok: bool,
    pub has_reasoning: bool,
    pub format_bonus: f64,
    pub iou: f64,
    pub localization: f64,
    pub rate_penalty: f64,
    pub predicted: Option<TimeInterval>,
    pub failure: Option<ScoreFailure>,
}

impl RewardResult {
    fn zero(format_ok: bool, has_reasoning: bool, failure: ScoreFailure) -> Self {
        Self {
            reward: 0.0,
            format_ok,
            has_reasoning,
            format_bonus: 0.0,
            iou: 0.0,
            localization: 0.0,
            rate_penalty: 0.0,
            predicted: None,
            failure: Some(failure),
        }
    }
}

/// A reward a trainer can call once per rollout, from many threads at once.
pub trait RewardFunction: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, response: &str, target: &GroundingTarget, video: &VideoMeta) -> RewardResult;
}

/// Looks up a reward implementation by its configured name.
pub fn by_name(
    name: &str,
    config: RewardConfig,
) -> Result<Option<Box<dyn RewardFunction>>, regex::Error> {
    let localization = match name.trim() {
        VIDEO_GROUNDING => LocalizationMode::Iou,
        VIDEO_GROUNDING_SEGMENT => LocalizationMode::Segment,
        _ => return Ok(None),
    };

    let scorer = GroundingScorer::new(RewardConfig {
        localization,
        ..config
    })?;
    Ok(Some(Box::new(scorer)))
}

#[derive(Debug, Clone)]
pub struct GroundingScorer {
    parser: GroundingParser,
    config: RewardConfig,
}

impl GroundingScorer {
    pub fn new(config: RewardConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            parser: GroundingParser::new()?,
            config,
        })
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn score(&self, response: &str, target: &GroundingTarget, video: &VideoMeta) -> RewardResult {
        let answer = match self.parser.parse(response) {
            Ok(answer) => answer,
            Err(err) => return RewardResult::zero(false, false, ScoreFailure::Parse(err)),
        };

        let duration = match check_metadata(target, video) {
            Ok(duration) => duration,
            Err(failure) => return RewardResult::zero(true, answer.has_reasoning, failure),
        };

        let predicted = match answer.address().interval(duration) {
            Ok(interval) => interval,
            Err(err) => {
                return RewardResult::zero(
                    true,
                    answer.has_reasoning,
                    mismatch(target, video, err.to_string()),
                );
            }
        };

        let iou = overlap(predicted, target.interval);
        let localization = match self.config.localization {
            LocalizationMode::Iou => iou,
            LocalizationMode::Segment => segment_score(answer.address(), target.canonical),
        };
        let format_bonus = format_bonus(&answer, &self.config);
        let rate_penalty = rate_penalty(answer.sampling_rate, video.effective_fps(), &self.config);

        let reward =
            (format_bonus + self.config.localization_weight * localization - rate_penalty).max(0.0);

        RewardResult {
            reward,
            format_ok: true,
            has_reasoning: answer.has_reasoning,
            format_bonus,
            iou,
            localization,
            rate_penalty,
            predicted: Some(predicted),
            failure: None,
        }
    }
}

impl RewardFunction for GroundingScorer {
    fn name(&self) -> &'static str {
        match self.config.localization {
            LocalizationMode::Iou => VIDEO_GROUNDING,
            LocalizationMode::Segment => VIDEO_GROUNDING_SEGMENT,
        }
    }

    fn score(&self, response: &str, target: &GroundingTarget, video: &VideoMeta) -> RewardResult {
        GroundingScorer::score(self, response, target, video)
    }
}

fn check_metadata(target: &GroundingTarget, video: &VideoMeta) -> Result<f64, ScoreFailure> {
    if target.video_id != video.video_id {
        return Err(mismatch(target, video, "video ids differ".to_string()));
    }

    let duration = validate_duration(video.duration_secs)
        .map_err(|err| mismatch(target, video, err.to_string()))?;

    let tolerance = 1.0 / video.effective_fps();
    if target.interval.end > duration + tolerance {
        return Err(mismatch(
            target,
            video,
            format!(
                "annotated end {:.3}s exceeds duration {:.3}s",
                target.interval.end, duration
            ),
        ));
    }

    Ok(duration)
}

fn mismatch(target: &GroundingTarget, video: &VideoMeta, detail: String) -> ScoreFailure {
    ScoreFailure::DurationMismatch {
        record_video: target.video_id.clone(),
        metadata_video: video.video_id.clone(),
        detail,
    }
}

pub fn format_bonus(answer: &GroundingAnswer, config: &RewardConfig) -> f64 {
    let structural = 1.0 - config.reasoning_share;
    if !answer.has_reasoning {
        return config.format_weight * structural;
    }

    let quality = if config.reasoning_target_chars == 0 {
        1.0
    } else {
        (answer.reasoning_chars() as f64 / config.reasoning_target_chars as f64).min(1.0)
    };
    config.format_weight * (structural + config.reasoning_share * quality)
}

/// Grows linearly below `min_rate` and saturates above the native frame rate; never exceeds
/// `rate_weight`.
pub fn rate_penalty(sampling_rate: f64, native_fps: f64, config: &RewardConfig) -> f64 {
    if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
        return config.rate_weight;
    }

    if sampling_rate < config.min_rate {
        return config.rate_weight * (config.min_rate - sampling_rate) / config.min_rate;
    }

    if native_fps > 0.0 && sampling_rate > native_fps {
        return config.rate_weight * (1.0 - native_fps / sampling_rate);
    }

    0.0
}

/// Partial credit for a predicted segment against the canonical one: circular segment
/// distance within a layer, layer distance across layers.
pub fn segment_score(predicted: SegmentAddress, canonical: SegmentAddress) -> f64 {
    if predicted == canonical {
        return 1.0;
    }

    if predicted.layer == canonical.layer {
        let count = segment_count(canonical.layer);
        let direct = predicted.segment_id.abs_diff(canonical.segment_id);
        let distance = direct.min(count - direct) as f64;
        let half = count as f64 / 2.0;
        return 0.8 * (1.0 - distance / half).max(0.0);
    }

    let layer_gap = f64::from(predicted.layer.abs_diff(canonical.layer));
    0.4 * (1.0 - layer_gap / 4.0).max(0.0)
}

pub struct ScoreRequest<'a> {
    pub response: &'a str,
    pub target: &'a GroundingTarget,
    pub video: &'a VideoMeta,
}

/// Scores a batch of independent rollouts on the current rayon pool; output order matches input.
pub fn score_batch<F>(reward: &F, batch: &[ScoreRequest<'_>]) -> Vec<RewardResult>
where
    F: RewardFunction + ?Sized,
{
    batch
        .par_iter()
        .map(|request| reward.score(request.response, request.target, request.video))
        .collect()
}
