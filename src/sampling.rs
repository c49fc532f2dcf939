use serde::{Deserialize, Serialize};

use crate::grounding::GroundingAnswer;
use crate::segment::{SegmentError, TimeInterval, validate_duration};
use crate::video::VideoMeta;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FramePlan {
    pub indices: Vec<u64>,
    pub timestamps: Vec<f64>,
}

impl FramePlan {
    fn from_indices(indices: Vec<u64>, fps: f64) -> Self {
        let timestamps = indices.iter().map(|index| *index as f64 / fps).collect();
        Self {
            indices,
            timestamps,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingPlan {
    pub interval: TimeInterval,
    pub frames: FramePlan,
}

/// `count` evenly spaced frame indices in `[first, last]`, including both ends when `count >= 2`.
pub fn uniform_indices(first: u64, last: u64, count: usize) -> Vec<u64> {
    if count == 0 || last < first {
        return Vec::new();
    }
    if count == 1 {
        return vec![first];
    }

    let span = (last - first) as f64;
    let steps = (count - 1) as f64;
    let mut indices = (0..count)
        .map(|step| first + (step as f64 * span / steps).round() as u64)
        .collect::<Vec<u64>>();
    indices.dedup();
    indices
}

pub fn natural_frame_count(duration_secs: f64, frames_per_minute: f64) -> usize {
    let count = (frames_per_minute * duration_secs / 60.0).round();
    if count.is_finite() && count >= 1.0 {
        count as usize
    } else {
        1
    }
}

/// Whole-video extraction plan at `frames_per_minute`. Past `max_frames` the plan is
/// re-spaced over the same span instead of truncated.
pub fn plan_video_frames(video: &VideoMeta, frames_per_minute: f64, max_frames: usize) -> FramePlan {
    let fps = video.effective_fps();
    let last_frame = video.frame_count().saturating_sub(1);
    let count = natural_frame_count(video.duration_secs, frames_per_minute)
        .min(last_frame as usize + 1)
        .min(max_frames.max(1));

    FramePlan::from_indices(uniform_indices(0, last_frame, count), fps)
}

/// Frames a policy would look at for one parsed grounding: the addressed segment sampled at
/// the answer's rate.
pub fn plan_grounding_frames(
    video: &VideoMeta,
    answer: &GroundingAnswer,
    max_frames: usize,
) -> Result<GroundingPlan, SegmentError> {
    let duration = validate_duration(video.duration_secs)?;
    let interval = answer.address().interval(duration)?;
    let fps = video.effective_fps();
    let last_video_frame = video.frame_count().saturating_sub(1);

    let first = ((interval.start * fps).floor() as u64).min(last_video_frame);
    let last = (((interval.end * fps).ceil() as u64).saturating_sub(1)).clamp(first, last_video_frame);

    let wanted = (interval.length() * answer.sampling_rate.min(fps)).ceil();
    let wanted = if wanted.is_finite() && wanted >= 1.0 {
        wanted as usize
    } else {
        1
    };
    let count = wanted
        .min((last - first) as usize + 1)
        .min(max_frames.max(1));

    Ok(GroundingPlan {
        interval,
        frames: FramePlan::from_indices(uniform_indices(first, last, count), fps),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(duration_secs: f64, native_fps: f64) -> VideoMeta {
        VideoMeta {
            video_id: "clip".to_string(),
            duration_secs,
            native_fps,
        }
    }

    #[test]
    fn uniform_indices_include_both_ends() {
        assert_eq!(uniform_indices(0, 9, 4), vec![0, 3, 6, 9]);
        assert_eq!(uniform_indices(10, 20, 2), vec![10, 20]);
        assert_eq!(uniform_indices(5, 100, 1), vec![5]);
        assert!(uniform_indices(0, 9, 0).is_empty());
    }

    #[test]
    fn uniform_indices_never_repeat_a_frame() {
        assert_eq!(uniform_indices(0, 2, 3), vec![0, 1, 2]);
        assert_eq!(uniform_indices(0, 9, 3), vec![0, 5, 9]);
    }

    #[test]
    fn video_plan_samples_frames_per_minute() {
        // 10 minutes at 25 fps, 2 frames per minute.
        let plan = plan_video_frames(&video(600.0, 25.0), 2.0, 64);
        assert_eq!(plan.len(), 20);
        assert_eq!(plan.indices[0], 0);
        assert_eq!(*plan.indices.last().expect("last frame"), 14_999);
        assert_eq!(plan.timestamps[0], 0.0);
        assert!((plan.timestamps[19] - 14_999.0 / 25.0).abs() < 1e-9);
    }

    #[test]
    fn video_plan_respects_the_frame_cap() {
        let plan = plan_video_frames(&video(3600.0, 30.0), 4.0, 32);
        assert_eq!(plan.len(), 32);
        assert_eq!(plan.indices[0], 0);
        assert_eq!(*plan.indices.last().expect("last frame"), 107_999);

        let gaps = plan
            .indices
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect::<Vec<u64>>();
        let min_gap = gaps.iter().min().copied().unwrap_or_default();
        let max_gap = gaps.iter().max().copied().unwrap_or_default();
        assert!(max_gap - min_gap <= 1);
    }

    #[test]
    fn short_video_still_gets_one_frame() {
        let plan = plan_video_frames(&video(5.0, 30.0), 1.0, 16);
        assert_eq!(plan.indices, vec![0]);
    }

    #[test]
    fn grounding_plan_samples_inside_the_segment() {
        let answer = GroundingAnswer {
            reasoning: None,
            has_reasoning: false,
            layer: 2,
            segment_id: 1,
            sampling_rate: 1.0,
        };
        let plan = plan_grounding_frames(&video(80.0, 10.0), &answer, 100).expect("plan");

        assert_eq!(plan.interval, TimeInterval::new(20.0, 40.0));
        assert_eq!(plan.frames.len(), 20);
        assert_eq!(plan.frames.indices[0], 200);
        assert_eq!(*plan.frames.indices.last().expect("last frame"), 399);
        assert!(
            plan.frames
                .timestamps
                .iter()
                .all(|ts| *ts >= 20.0 && *ts < 40.0)
        );
    }

    #[test]
    fn grounding_plan_caps_rate_at_native_fps_and_max_frames() {
        let answer = GroundingAnswer {
            reasoning: None,
            has_reasoning: false,
            layer: 0,
            segment_id: 0,
            sampling_rate: 240.0,
        };
        let plan = plan_grounding_frames(&video(2.0, 24.0), &answer, 1000).expect("plan");
        assert_eq!(plan.frames.len(), 48);

        let capped = plan_grounding_frames(&video(2.0, 24.0), &answer, 8).expect("plan");
        assert_eq!(capped.frames.len(), 8);
    }
}
