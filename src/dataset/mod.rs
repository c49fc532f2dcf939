//! Turns annotated videos into training records.
//!
//! Work is grouped per video so frames are probed and extracted once and shared
//! by every question about that video. Videos run on a bounded rayon pool; a
//! missing or broken video only skips its own annotations.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::alignment::{LayerPolicy, canonical_grounding};
use crate::annotation::{GroundTruthAnnotation, Split};
use crate::grounding::render_grounding_tag;
use crate::prompt::PromptTemplate;
use crate::reward::GroundingTarget;
use crate::sampling::plan_video_frames;
use crate::segment::{MAX_LAYER, SegmentAddress, TimeInterval};
use crate::util::stable_unit_fraction;
use crate::video::{ExtractedFrame, FrameSource, VideoError, VideoMeta, resolve_video_path};

#[cfg(test)]
mod tests;

/// Sampling-rate slot of a stored ground truth; the annotation carries no rate.
pub const GROUND_TRUTH_RATE_PLACEHOLDER: f64 = 0.0;

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub frames_per_minute: f64,
    pub max_frames: usize,
    pub layer_policy: LayerPolicy,
    pub test_ratio: f64,
    pub split_seed: u64,
    pub workers: usize,
    pub prompt: PromptTemplate,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            frames_per_minute: 1.0,
            max_frames: 32,
            layer_policy: LayerPolicy::default(),
            test_ratio: 0.2,
            split_seed: 42,
            workers: 4,
            prompt: PromptTemplate::default(),
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.frames_per_minute.is_finite() || self.frames_per_minute <= 0.0 {
            bail!(
                "frames per minute must be a positive number, got {}",
                self.frames_per_minute
            );
        }
        if self.max_frames == 0 {
            bail!("max frames must be at least 1");
        }
        if !(0.0..1.0).contains(&self.test_ratio) {
            bail!("test ratio must be within [0, 1), got {}", self.test_ratio);
        }
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }

        match self.layer_policy {
            LayerPolicy::BestIou {
                max_layer,
                granular_iou,
            } => {
                check_layer(max_layer)?;
                if !(0.0..=1.0).contains(&granular_iou) {
                    bail!("granular IoU must be within [0, 1], got {granular_iou}");
                }
            }
            LayerPolicy::Fixed { layer } => check_layer(layer)?,
            LayerPolicy::MinSegment {
                min_segment_secs,
                max_layer,
            } => {
                check_layer(max_layer)?;
                if !min_segment_secs.is_finite() || min_segment_secs <= 0.0 {
                    bail!("minimum segment length must be positive, got {min_segment_secs}");
                }
            }
        }

        Ok(())
    }
}

fn check_layer(layer: u32) -> Result<()> {
    if layer > MAX_LAYER {
        bail!("layer {layer} exceeds the deepest supported layer {MAX_LAYER}");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRecord {
    pub record_id: String,
    pub split: Split,
    pub question: String,
    pub prompt: String,
    pub answer: String,
    pub grounding: SegmentAddress,
    pub grounding_iou: f64,
    pub ground_truth: TimeInterval,
    pub time_reference: String,
    pub reference_answer: String,
    pub video: VideoMeta,
    pub frames: Arc<Vec<ExtractedFrame>>,
}

impl TrainingRecord {
    pub fn target(&self) -> GroundingTarget {
        GroundingTarget {
            video_id: self.video.video_id.clone(),
            interval: self.ground_truth,
            canonical: self.grounding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("no video file for this key in {video_dir}")]
    VideoNotFound { video_dir: String },

    #[error("ground-truth interval is empty (time reference {time_reference:?})")]
    EmptyAnnotation { time_reference: String },

    #[error("ground truth ends at {end:.3}s, past the video duration {duration:.3}s")]
    OutOfBounds { end: f64, duration: f64 },

    #[error("frame extraction failed: {detail}")]
    ExtractionFailed { detail: String },

    #[error("duplicate annotation uid")]
    DuplicateUid,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::VideoNotFound { .. } => "video_not_found",
            Self::EmptyAnnotation { .. } => "empty_annotation",
            Self::OutOfBounds { .. } => "out_of_bounds",
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::DuplicateUid => "duplicate_uid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedAnnotation {
    pub uid: String,
    pub video_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct BuildOutput {
    pub records: Vec<TrainingRecord>,
    pub skipped: Vec<SkippedAnnotation>,
    pub videos_total: usize,
    pub videos_processed: usize,
    pub frames_extracted: usize,
}

impl BuildOutput {
    pub fn split_records(&self, split: Split) -> Vec<&TrainingRecord> {
        self.records
            .iter()
            .filter(|record| record.split == split)
            .collect()
    }

    pub fn skipped_count(&self, code: &str) -> usize {
        self.skipped
            .iter()
            .filter(|skip| skip.reason.code() == code)
            .count()
    }
}

#[derive(Debug, Default)]
struct VideoOutcome {
    records: Vec<TrainingRecord>,
    skipped: Vec<SkippedAnnotation>,
    processed: bool,
    frames_extracted: usize,
}

impl VideoOutcome {
    fn skip(&mut self, annotation: &GroundTruthAnnotation, reason: SkipReason) {
        warn!(
            uid = %annotation.uid,
            video_id = %annotation.video_id,
            reason = reason.code(),
            detail = %reason,
            "skipping annotation"
        );
        self.skipped.push(SkippedAnnotation {
            uid: annotation.uid.clone(),
            video_id: annotation.video_id.clone(),
            reason,
        });
    }
}

/// Builds one record per usable annotation. Per-annotation problems are skipped and
/// reported; invalid configuration, zero-length videos and an empty result fail the build.
pub fn build(
    annotations: &[GroundTruthAnnotation],
    video_dir: &Path,
    config: &BuildConfig,
    source: &dyn FrameSource,
) -> Result<BuildOutput> {
    config.validate()?;

    let (unique, duplicates) = dedupe_uids(annotations);
    let groups = group_by_video(&unique);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|index| format!("video-worker-{index}"))
        .build()
        .context("failed to start video worker pool")?;

    info!(
        annotations = annotations.len(),
        videos = groups.len(),
        workers = config.workers,
        "building grounding records"
    );

    let outcomes = pool.install(|| {
        groups
            .par_iter()
            .map(|(video_id, items)| process_video(video_id, items, video_dir, config, source))
            .collect::<Result<Vec<VideoOutcome>>>()
    })?;

    let mut output = BuildOutput {
        videos_total: groups.len(),
        ..BuildOutput::default()
    };

    for outcome in outcomes {
        output.records.extend(outcome.records);
        output.skipped.extend(outcome.skipped);
        output.frames_extracted += outcome.frames_extracted;
        if outcome.processed {
            output.videos_processed += 1;
        }
    }
    output.skipped.extend(duplicates);

    if output.records.is_empty() {
        bail!(
            "no valid records were produced from {} annotations ({} skipped)",
            annotations.len(),
            output.skipped.len()
        );
    }

    Ok(output)
}

/// Keeps the first annotation of every uid in input order; later ones are skipped.
fn dedupe_uids(
    annotations: &[GroundTruthAnnotation],
) -> (Vec<&GroundTruthAnnotation>, Vec<SkippedAnnotation>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(annotations.len());
    let mut duplicates = Vec::new();

    for annotation in annotations {
        if seen.insert(annotation.uid.as_str()) {
            unique.push(annotation);
        } else {
            warn!(
                uid = %annotation.uid,
                video_id = %annotation.video_id,
                "skipping duplicate annotation uid"
            );
            duplicates.push(SkippedAnnotation {
                uid: annotation.uid.clone(),
                video_id: annotation.video_id.clone(),
                reason: SkipReason::DuplicateUid,
            });
        }
    }

    (unique, duplicates)
}

fn group_by_video<'a>(
    annotations: &[&'a GroundTruthAnnotation],
) -> Vec<(String, Vec<&'a GroundTruthAnnotation>)> {
    let mut positions = HashMap::<&str, usize>::new();
    let mut groups = Vec::<(String, Vec<&'a GroundTruthAnnotation>)>::new();

    for &annotation in annotations {
        let position = *positions
            .entry(annotation.video_id.as_str())
            .or_insert_with(|| {
                groups.push((annotation.video_id.clone(), Vec::new()));
                groups.len() - 1
            });
        groups[position].1.push(annotation);
    }

    groups
}

fn process_video(
    video_id: &str,
    items: &[&GroundTruthAnnotation],
    video_dir: &Path,
    config: &BuildConfig,
    source: &dyn FrameSource,
) -> Result<VideoOutcome> {
    let mut outcome = VideoOutcome::default();

    let Some(path) = resolve_video_path(video_dir, video_id) else {
        for annotation in items {
            outcome.skip(
                annotation,
                SkipReason::VideoNotFound {
                    video_dir: video_dir.display().to_string(),
                },
            );
        }
        return Ok(outcome);
    };

    let meta = match source.probe(video_id, &path) {
        Ok(meta) => meta,
        Err(err) => {
            let reason = match err {
                VideoError::NotFound(_) => SkipReason::VideoNotFound {
                    video_dir: video_dir.display().to_string(),
                },
                other => SkipReason::ExtractionFailed {
                    detail: other.to_string(),
                },
            };
            for annotation in items {
                outcome.skip(annotation, reason.clone());
            }
            return Ok(outcome);
        }
    };

    if !meta.duration_secs.is_finite() || meta.duration_secs <= 0.0 {
        bail!(
            "video {} at {} reports a zero or invalid duration ({})",
            video_id,
            path.display(),
            meta.duration_secs
        );
    }

    let mut usable = Vec::<(&GroundTruthAnnotation, TimeInterval)>::new();
    for annotation in items {
        match checked_interval(annotation, &meta) {
            Ok(interval) => usable.push((annotation, interval)),
            Err(reason) => outcome.skip(annotation, reason),
        }
    }

    if usable.is_empty() {
        return Ok(outcome);
    }

    let plan = plan_video_frames(&meta, config.frames_per_minute, config.max_frames);
    let frames = match source.extract_frames(&path, &plan) {
        Ok(frames) if !frames.is_empty() => Arc::new(frames),
        Ok(_) => {
            for (annotation, _) in &usable {
                outcome.skip(
                    annotation,
                    SkipReason::ExtractionFailed {
                        detail: "no frames could be decoded".to_string(),
                    },
                );
            }
            return Ok(outcome);
        }
        Err(err) => {
            for (annotation, _) in &usable {
                outcome.skip(
                    annotation,
                    SkipReason::ExtractionFailed {
                        detail: err.to_string(),
                    },
                );
            }
            return Ok(outcome);
        }
    };

    outcome.processed = true;
    outcome.frames_extracted = frames.len();

    for (annotation, interval) in usable {
        let canonical = canonical_grounding(interval, meta.duration_secs, config.layer_policy)
            .with_context(|| format!("failed to align annotation {}", annotation.uid))?;

        let prompt = config.prompt.render(
            &annotation.question,
            frames.len(),
            meta.duration_secs,
            config.layer_policy.deepest_layer(),
        );

        outcome.records.push(TrainingRecord {
            record_id: annotation.uid.clone(),
            split: annotation
                .split
                .unwrap_or_else(|| assign_split(&annotation.uid, config.split_seed, config.test_ratio)),
            question: annotation.question.clone(),
            prompt,
            answer: render_grounding_tag(canonical.address, GROUND_TRUTH_RATE_PLACEHOLDER),
            grounding: canonical.address,
            grounding_iou: canonical.iou,
            ground_truth: interval,
            time_reference: annotation.time_reference.clone(),
            reference_answer: annotation.answer.clone(),
            video: meta.clone(),
            frames: Arc::clone(&frames),
        });
    }

    info!(
        video_id = %video_id,
        duration_secs = meta.duration_secs,
        native_fps = meta.native_fps,
        frames = frames.len(),
        records = outcome.records.len(),
        "processed video"
    );

    Ok(outcome)
}

/// Validates an annotation's interval against the probed video, clamping ends that overshoot
/// by less than one frame.
fn checked_interval(
    annotation: &GroundTruthAnnotation,
    meta: &VideoMeta,
) -> Result<TimeInterval, SkipReason> {
    let empty = || SkipReason::EmptyAnnotation {
        time_reference: annotation.time_reference.clone(),
    };

    let interval = annotation.interval.ok_or_else(empty)?;
    if interval.is_degenerate() || interval.start < 0.0 {
        return Err(empty());
    }

    let tolerance = 1.0 / meta.effective_fps();
    if interval.end > meta.duration_secs + tolerance {
        return Err(SkipReason::OutOfBounds {
            end: interval.end,
            duration: meta.duration_secs,
        });
    }

    let clamped = TimeInterval::new(interval.start, interval.end.min(meta.duration_secs));
    if clamped.is_degenerate() {
        return Err(empty());
    }
    Ok(clamped)
}

pub fn assign_split(uid: &str, seed: u64, test_ratio: f64) -> Split {
    if stable_unit_fraction(&format!("{seed}:{uid}")) < test_ratio {
        Split::Test
    } else {
        Split::Train
    }
}
