use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "video-grounding",
    version,
    about = "Segment-tree grounding datasets and rewards for long videos"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Build(BuildArgs),
    Score(ScoreArgs),
    Inventory(InventoryArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[arg(long = "json_file", alias = "json-file")]
    pub json_file: PathBuf,

    #[arg(long = "video_dir", alias = "video-dir")]
    pub video_dir: PathBuf,

    #[arg(long = "output_dir", alias = "output-dir")]
    pub output_dir: PathBuf,

    #[arg(long = "frames_per_min", alias = "frames-per-min", default_value_t = 1.0)]
    pub frames_per_min: f64,

    #[arg(long, default_value_t = 32)]
    pub max_frames: usize,

    #[arg(long, default_value_t = 0.2)]
    pub test_ratio: f64,

    #[arg(long, default_value_t = 42)]
    pub split_seed: u64,

    #[arg(long, value_enum, default_value_t = LayerPolicyKind::BestIou)]
    pub layer_policy: LayerPolicyKind,

    #[arg(long, default_value_t = 4)]
    pub max_layer: u32,

    #[arg(long)]
    pub fixed_layer: Option<u32>,

    #[arg(long)]
    pub min_segment_secs: Option<f64>,

    #[arg(long, default_value_t = 0.7)]
    pub granular_iou: f64,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = 120)]
    pub video_timeout_secs: u64,

    #[arg(long, default_value_t = 448)]
    pub frame_width: u32,

    #[arg(long)]
    pub prompt_template: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LayerPolicyKind {
    BestIou,
    Fixed,
    MinSegment,
}

impl LayerPolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BestIou => "best-iou",
            Self::Fixed => "fixed",
            Self::MinSegment => "min-segment",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Split file written by `build`.
    #[arg(long)]
    pub split_path: PathBuf,

    /// JSONL file, one `{"record_id": .., "response": ..}` object per line.
    #[arg(long)]
    pub responses: PathBuf,

    #[arg(long, default_value = "video_grounding")]
    pub reward: String,

    #[arg(long)]
    pub reward_config: Option<PathBuf>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,

    /// Frame cap for the per-response grounding plan.
    #[arg(long, default_value_t = 32)]
    pub max_frames: usize,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long = "video_dir", alias = "video-dir")]
    pub video_dir: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = 120)]
    pub video_timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long = "output_dir", alias = "output-dir")]
    pub output_dir: PathBuf,
}
