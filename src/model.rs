use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::alignment::LayerPolicy;
use crate::reward::{RewardConfig, RewardResult};
use crate::sampling::GroundingPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoEntry {
    pub filename: String,
    pub video_id: String,
    pub duration_secs: Option<f64>,
    pub native_fps: Option<f64>,
    pub sha256: String,
    pub probe_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub video_count: usize,
    pub probe_failures: usize,
    pub videos: Vec<VideoEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolVersions {
    pub ffprobe: Option<String>,
    pub ffmpeg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPaths {
    pub annotation_path: String,
    pub video_dir: String,
    pub output_dir: String,
    pub train_path: String,
    pub test_path: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    pub frames_per_minute: f64,
    pub max_frames: usize,
    pub layer_policy: LayerPolicy,
    pub test_ratio: f64,
    pub split_seed: u64,
    pub workers: usize,
    pub video_timeout_secs: u64,
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildCounts {
    pub annotations_total: usize,
    pub videos_total: usize,
    pub videos_processed: usize,
    pub records_built: usize,
    pub train_records: usize,
    pub test_records: usize,
    pub frames_extracted: usize,
    pub skipped_total: usize,
    pub skipped_video_not_found: usize,
    pub skipped_empty_annotation: usize,
    pub skipped_out_of_bounds: usize,
    pub skipped_extraction_failed: usize,
    pub skipped_duplicate_uid: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub tool_versions: ToolVersions,
    pub paths: BuildPaths,
    pub settings: BuildSettings,
    pub counts: BuildCounts,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredResponse {
    pub record_id: String,
    pub result: RewardResult,
    /// Frames a follow-up pass would sample for the predicted segment; absent when the
    /// response did not parse.
    pub plan: Option<GroundingPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub manifest_version: u32,
    pub generated_at: String,
    pub reward_name: String,
    pub split_path: String,
    pub responses_path: String,
    pub config: RewardConfig,
    pub scored: usize,
    pub unknown_record_ids: Vec<String>,
    pub mean_reward: f64,
    pub mean_iou: f64,
    pub format_ok_rate: f64,
    pub failures_by_kind: BTreeMap<String, usize>,
    pub results: Vec<ScoredResponse>,
}
