use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::alignment::overlap;
use crate::sampling::FramePlan;
use crate::segment::segment_count;

struct FakeSource {
    metas: HashMap<String, VideoMeta>,
    broken: HashSet<String>,
    probes: AtomicUsize,
    extractions: AtomicUsize,
}

impl FakeSource {
    fn new(videos: &[(&str, f64, f64)]) -> Self {
        Self {
            metas: videos
                .iter()
                .map(|(video_id, duration_secs, native_fps)| {
                    (
                        video_id.to_string(),
                        VideoMeta {
                            video_id: video_id.to_string(),
                            duration_secs: *duration_secs,
                            native_fps: *native_fps,
                        },
                    )
                })
                .collect(),
            broken: HashSet::new(),
            probes: AtomicUsize::new(0),
            extractions: AtomicUsize::new(0),
        }
    }
}

impl FrameSource for FakeSource {
    fn probe(&self, video_id: &str, path: &Path) -> Result<VideoMeta, VideoError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(video_id) {
            return Err(VideoError::ExecutionFailed {
                program: "ffprobe",
                exit_code: Some(1),
                stderr: "moov atom not found".to_string(),
            });
        }
        self.metas
            .get(video_id)
            .cloned()
            .ok_or_else(|| VideoError::NotFound(path.display().to_string()))
    }

    fn extract_frames(
        &self,
        _path: &Path,
        plan: &FramePlan,
    ) -> Result<Vec<ExtractedFrame>, VideoError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(plan
            .indices
            .iter()
            .zip(plan.timestamps.iter())
            .map(|(frame_index, timestamp_secs)| ExtractedFrame {
                frame_index: *frame_index,
                timestamp_secs: *timestamp_secs,
                jpeg: vec![0xFF, 0xD8, (*frame_index % 251) as u8],
            })
            .collect())
    }
}

struct TempVideoDir {
    path: PathBuf,
}

impl TempVideoDir {
    fn with_videos(label: &str, video_ids: &[&str]) -> Self {
        let path = std::env::temp_dir().join(format!(
            "video_grounding_{label}_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&path).expect("create temp video dir");
        for video_id in video_ids {
            fs::write(path.join(format!("{video_id}.mp4")), b"fake video").expect("write video");
        }
        Self { path }
    }
}

impl Drop for TempVideoDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn annotation(uid: &str, video_id: &str, interval: Option<(f64, f64)>) -> GroundTruthAnnotation {
    GroundTruthAnnotation {
        uid: uid.to_string(),
        video_id: video_id.to_string(),
        question: format!("What happens in {uid}?"),
        answer: "something".to_string(),
        time_reference: interval
            .map(|(start, end)| format!("{start}-{end}"))
            .unwrap_or_else(|| "??".to_string()),
        interval: interval.map(|(start, end)| TimeInterval::new(start, end)),
        split: None,
    }
}

fn config() -> BuildConfig {
    BuildConfig {
        workers: 2,
        ..BuildConfig::default()
    }
}

#[test]
fn missing_video_is_skipped_and_valid_video_is_built() {
    let dir = TempVideoDir::with_videos("missing", &["present"]);
    let source = FakeSource::new(&[("present", 120.0, 30.0)]);
    let annotations = vec![
        annotation("q1", "present", Some((15.0, 19.0))),
        annotation("q2", "absent", Some((5.0, 9.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");

    assert_eq!(output.records.len(), 1);
    assert_eq!(output.records[0].record_id, "q1");
    assert_eq!(output.skipped.len(), 1);
    assert_eq!(output.skipped[0].uid, "q2");
    assert_eq!(output.skipped[0].reason.code(), "video_not_found");
    assert_eq!(output.videos_total, 2);
    assert_eq!(output.videos_processed, 1);

    let record = &output.records[0];
    // Two minutes at one frame per minute: first and last frame.
    assert_eq!(record.frames.len(), 2);
    assert_eq!(record.frames[0].frame_index, 0);
    assert_eq!(record.frames[1].frame_index, 3599);
    assert_eq!(record.prompt.matches("<image>").count(), 2);
    assert!(record.prompt.ends_with("What happens in q1?"));
    assert_eq!(record.ground_truth, TimeInterval::new(15.0, 19.0));
    assert_eq!(
        record.answer,
        format!(
            "<grounding>{}, {}, 0</grounding>",
            record.grounding.layer, record.grounding.segment_id
        )
    );
    assert_eq!(record.target().canonical, record.grounding);
}

#[test]
fn degenerate_and_out_of_bounds_annotations_are_skipped() {
    let dir = TempVideoDir::with_videos("bounds", &["clip"]);
    let source = FakeSource::new(&[("clip", 120.0, 30.0)]);
    let annotations = vec![
        annotation("flat", "clip", Some((30.0, 30.0))),
        annotation("backwards", "clip", Some((40.0, 30.0))),
        annotation("unreadable", "clip", None),
        annotation("beyond", "clip", Some((100.0, 200.0))),
        annotation("edge", "clip", Some((110.0, 120.01))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");

    assert_eq!(output.records.len(), 1);
    assert_eq!(output.records[0].record_id, "edge");
    assert_eq!(output.records[0].ground_truth, TimeInterval::new(110.0, 120.0));
    assert_eq!(output.skipped_count("empty_annotation"), 3);
    assert_eq!(output.skipped_count("out_of_bounds"), 1);
}

#[test]
fn stored_grounding_is_the_best_segment_at_its_layer() {
    let dir = TempVideoDir::with_videos("argmax", &["match"]);
    let source = FakeSource::new(&[("match", 5400.0, 25.0)]);
    let intervals = [
        (0.0, 60.0),
        (1200.0, 1500.0),
        (2690.0, 2710.0),
        (4000.0, 5400.0),
        (333.3, 999.9),
    ];
    let annotations = intervals
        .iter()
        .enumerate()
        .map(|(index, interval)| annotation(&format!("m{index}"), "match", Some(*interval)))
        .collect::<Vec<_>>();

    for policy in [
        LayerPolicy::default(),
        LayerPolicy::Fixed { layer: 3 },
        LayerPolicy::MinSegment {
            min_segment_secs: 300.0,
            max_layer: 6,
        },
    ] {
        let config = BuildConfig {
            layer_policy: policy,
            ..config()
        };
        let output = build(&annotations, &dir.path, &config, &source).expect("build succeeds");
        assert_eq!(output.records.len(), intervals.len());

        for record in &output.records {
            let duration = record.video.duration_secs;
            let stored = record
                .grounding
                .interval(duration)
                .expect("stored grounding interval");
            let stored_iou = overlap(stored, record.ground_truth);
            assert!((stored_iou - record.grounding_iou).abs() < 1e-12);

            let layer = record.grounding.layer;
            for segment_id in 0..segment_count(layer) {
                let other = SegmentAddress { layer, segment_id }
                    .interval(duration)
                    .expect("segment interval");
                assert!(stored_iou >= overlap(other, record.ground_truth));
            }
        }
    }
}

#[test]
fn zero_duration_video_fails_the_build() {
    let dir = TempVideoDir::with_videos("zero", &["empty", "fine"]);
    let source = FakeSource::new(&[("empty", 0.0, 30.0), ("fine", 60.0, 30.0)]);
    let annotations = vec![
        annotation("a", "fine", Some((1.0, 2.0))),
        annotation("b", "empty", Some((1.0, 2.0))),
    ];

    let err = build(&annotations, &dir.path, &config(), &source).expect_err("zero duration");
    assert!(err.to_string().contains("zero or invalid duration"));
}

#[test]
fn invalid_configuration_fails_before_any_video_is_touched() {
    let dir = TempVideoDir::with_videos("config", &["clip"]);
    let source = FakeSource::new(&[("clip", 60.0, 30.0)]);
    let annotations = vec![annotation("a", "clip", Some((1.0, 2.0)))];

    for bad in [
        BuildConfig {
            frames_per_minute: 0.0,
            ..config()
        },
        BuildConfig {
            max_frames: 0,
            ..config()
        },
        BuildConfig {
            test_ratio: 1.0,
            ..config()
        },
        BuildConfig {
            workers: 0,
            ..config()
        },
        BuildConfig {
            layer_policy: LayerPolicy::Fixed {
                layer: MAX_LAYER + 1,
            },
            ..config()
        },
    ] {
        assert!(build(&annotations, &dir.path, &bad, &source).is_err());
    }
    assert_eq!(source.probes.load(Ordering::SeqCst), 0);
}

#[test]
fn build_without_any_record_fails() {
    let dir = TempVideoDir::with_videos("none", &[]);
    let source = FakeSource::new(&[]);
    let annotations = vec![annotation("a", "ghost", Some((1.0, 2.0)))];

    let err = build(&annotations, &dir.path, &config(), &source).expect_err("nothing built");
    assert!(err.to_string().contains("no valid records"));
}

#[test]
fn broken_video_only_skips_its_own_annotations() {
    let dir = TempVideoDir::with_videos("broken", &["corrupt", "good"]);
    let mut source = FakeSource::new(&[("corrupt", 60.0, 30.0), ("good", 60.0, 30.0)]);
    source.broken.insert("corrupt".to_string());
    let annotations = vec![
        annotation("c1", "corrupt", Some((1.0, 2.0))),
        annotation("c2", "corrupt", Some((3.0, 4.0))),
        annotation("g1", "good", Some((1.0, 2.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.skipped_count("extraction_failed"), 2);
}

#[test]
fn frames_are_extracted_once_per_video_and_shared() {
    let dir = TempVideoDir::with_videos("shared", &["talk"]);
    let source = FakeSource::new(&[("talk", 600.0, 30.0)]);
    let annotations = vec![
        annotation("t1", "talk", Some((10.0, 20.0))),
        annotation("t2", "talk", Some((300.0, 400.0))),
        annotation("t3", "talk", Some((500.0, 600.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");
    assert_eq!(output.records.len(), 3);
    assert_eq!(source.extractions.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&output.records[0].frames, &output.records[2].frames));
    assert_eq!(output.frames_extracted, 10);
}

#[test]
fn frame_count_is_capped() {
    let dir = TempVideoDir::with_videos("cap", &["long"]);
    let source = FakeSource::new(&[("long", 3600.0, 30.0)]);
    let annotations = vec![annotation("l1", "long", Some((10.0, 20.0)))];
    let config = BuildConfig {
        frames_per_minute: 10.0,
        max_frames: 16,
        ..config()
    };

    let output = build(&annotations, &dir.path, &config, &source).expect("build succeeds");
    let frames = &output.records[0].frames;
    assert_eq!(frames.len(), 16);
    assert_eq!(frames[0].frame_index, 0);
    assert_eq!(frames[15].frame_index, 107_999);
}

#[test]
fn duplicate_uids_keep_the_first_record() {
    let dir = TempVideoDir::with_videos("dupes", &["a", "b"]);
    let source = FakeSource::new(&[("a", 60.0, 30.0), ("b", 60.0, 30.0)]);
    let annotations = vec![
        annotation("same", "a", Some((1.0, 2.0))),
        annotation("same", "b", Some((1.0, 2.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.records[0].video.video_id, "a");
    assert_eq!(output.skipped_count("duplicate_uid"), 1);
}

#[test]
fn duplicate_uids_follow_input_order_across_videos() {
    let dir = TempVideoDir::with_videos("dupes_order", &["a", "b"]);
    let source = FakeSource::new(&[("a", 60.0, 30.0), ("b", 60.0, 30.0)]);
    let annotations = vec![
        annotation("x", "a", Some((1.0, 2.0))),
        annotation("same", "b", Some((3.0, 4.0))),
        annotation("same", "a", Some((5.0, 6.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");
    let kept = output
        .records
        .iter()
        .find(|record| record.record_id == "same")
        .expect("kept record");
    assert_eq!(kept.video.video_id, "b");
    assert_eq!(kept.ground_truth, TimeInterval::new(3.0, 4.0));
    assert_eq!(output.records.len(), 2);

    let skipped = output
        .skipped
        .iter()
        .find(|skip| skip.reason == SkipReason::DuplicateUid)
        .expect("duplicate skip");
    assert_eq!(skipped.video_id, "a");
}

#[test]
fn videos_holding_only_duplicates_are_never_extracted() {
    let dir = TempVideoDir::with_videos("dupes_extract", &["a", "b"]);
    let source = FakeSource::new(&[("a", 60.0, 30.0), ("b", 60.0, 30.0)]);
    let annotations = vec![
        annotation("only", "a", Some((1.0, 2.0))),
        annotation("only", "b", Some((1.0, 2.0))),
    ];

    let output = build(&annotations, &dir.path, &config(), &source).expect("build succeeds");
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.videos_total, 1);
    assert_eq!(source.probes.load(Ordering::SeqCst), 1);
    assert_eq!(source.extractions.load(Ordering::SeqCst), 1);
}

#[test]
fn explicit_split_wins_over_the_hash_split() {
    let dir = TempVideoDir::with_videos("split", &["clip"]);
    let source = FakeSource::new(&[("clip", 60.0, 30.0)]);
    let mut pinned = annotation("pinned", "clip", Some((1.0, 2.0)));
    pinned.split = Some(Split::Test);
    let annotations = vec![pinned, annotation("free", "clip", Some((3.0, 4.0)))];
    let config = BuildConfig {
        test_ratio: 0.0,
        ..config()
    };

    let output = build(&annotations, &dir.path, &config, &source).expect("build succeeds");
    assert_eq!(output.split_records(Split::Test).len(), 1);
    assert_eq!(output.split_records(Split::Test)[0].record_id, "pinned");
    assert_eq!(output.split_records(Split::Train)[0].record_id, "free");
}

#[test]
fn hash_split_is_deterministic_and_roughly_proportional() {
    let test_count = (0..1000)
        .filter(|index| assign_split(&format!("uid-{index}"), 42, 0.2) == Split::Test)
        .count();
    assert!((120..=280).contains(&test_count), "{test_count}");

    assert_eq!(assign_split("uid-7", 42, 0.2), assign_split("uid-7", 42, 0.2));
    assert_eq!(assign_split("uid-7", 42, 0.0), Split::Train);
}
