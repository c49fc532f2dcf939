use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use video_grounding::alignment::LayerPolicy;
use video_grounding::annotation::{Split, load_annotations};
use video_grounding::dataset::{self, BuildConfig, BuildOutput};
use video_grounding::model::{BuildCounts, BuildPaths, BuildRunManifest, BuildSettings, ToolVersions};
use video_grounding::prompt::PromptTemplate;
use video_grounding::store;
use video_grounding::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};
use video_grounding::video::{FfmpegFrameSource, tool_version};

use crate::cli::{BuildArgs, LayerPolicyKind};
use crate::commands::BUILD_MANIFEST_FILE;

pub fn run(args: BuildArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("build-{}", utc_compact_string(started_ts));

    let prompt = match &args.prompt_template {
        Some(path) => PromptTemplate::from_file(path)?,
        None => PromptTemplate::default(),
    };
    let config = BuildConfig {
        frames_per_minute: args.frames_per_min,
        max_frames: args.max_frames,
        layer_policy: layer_policy_from_args(&args)?,
        test_ratio: args.test_ratio,
        split_seed: args.split_seed,
        workers: args.workers,
        prompt,
    };
    config.validate()?;
    if args.video_timeout_secs == 0 {
        bail!("video timeout must be at least one second");
    }
    if !args.video_dir.is_dir() {
        bail!("video directory does not exist: {}", args.video_dir.display());
    }

    let annotations = load_annotations(&args.json_file)?;
    info!(
        run_id = %run_id,
        annotations = annotations.len(),
        source = %args.json_file.display(),
        "loaded annotations"
    );

    ensure_directory(&args.output_dir)?;
    let train_path = store::split_path(&args.output_dir, Split::Train);
    let test_path = store::split_path(&args.output_dir, Split::Test);
    let manifest_path = args
        .manifest_path
        .clone()
        .unwrap_or_else(|| args.output_dir.join(BUILD_MANIFEST_FILE));

    let source = FfmpegFrameSource::new(
        Duration::from_secs(args.video_timeout_secs),
        args.frame_width,
    );
    let output = dataset::build(&annotations, &args.video_dir, &config, &source)?;

    let train_records = store::write_split(&train_path, &output.split_records(Split::Train))?;
    let test_records = store::write_split(&test_path, &output.split_records(Split::Test))?;
    info!(path = %train_path.display(), records = train_records, "wrote train split");
    info!(path = %test_path.display(), records = test_records, "wrote test split");

    if test_records == 0 && config.test_ratio > 0.0 {
        warn!("test split is empty");
    }

    let manifest = BuildRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_build_command(&args),
        tool_versions: ToolVersions {
            ffprobe: tool_version("ffprobe"),
            ffmpeg: tool_version("ffmpeg"),
        },
        paths: BuildPaths {
            annotation_path: args.json_file.display().to_string(),
            video_dir: args.video_dir.display().to_string(),
            output_dir: args.output_dir.display().to_string(),
            train_path: train_path.display().to_string(),
            test_path: test_path.display().to_string(),
            manifest_path: manifest_path.display().to_string(),
        },
        settings: BuildSettings {
            frames_per_minute: config.frames_per_minute,
            max_frames: config.max_frames,
            layer_policy: config.layer_policy,
            test_ratio: config.test_ratio,
            split_seed: config.split_seed,
            workers: config.workers,
            video_timeout_secs: args.video_timeout_secs,
            prompt_template: args
                .prompt_template
                .as_ref()
                .map(|path| path.display().to_string()),
        },
        counts: build_counts(annotations.len(), &output, train_records, test_records),
        warnings: output
            .skipped
            .iter()
            .map(|skip| {
                format!(
                    "{} ({}): {}: {}",
                    skip.uid,
                    skip.video_id,
                    skip.reason.code(),
                    skip.reason
                )
            })
            .collect(),
        notes: vec![
            "Ground-truth answers carry a sampling-rate placeholder of 0.".to_string(),
            format!(
                "Canonical groundings use the {} layer policy.",
                args.layer_policy.as_str()
            ),
        ],
    };

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote build manifest");
    info!(
        records = output.records.len(),
        train = train_records,
        test = test_records,
        skipped = output.skipped.len(),
        videos = output.videos_processed,
        frames = output.frames_extracted,
        "build completed"
    );

    Ok(())
}

fn layer_policy_from_args(args: &BuildArgs) -> Result<LayerPolicy> {
    let policy = match args.layer_policy {
        LayerPolicyKind::BestIou => LayerPolicy::BestIou {
            max_layer: args.max_layer,
            granular_iou: args.granular_iou,
        },
        LayerPolicyKind::Fixed => match args.fixed_layer {
            Some(layer) => LayerPolicy::Fixed { layer },
            None => bail!("--layer-policy fixed requires --fixed-layer"),
        },
        LayerPolicyKind::MinSegment => match args.min_segment_secs {
            Some(min_segment_secs) => LayerPolicy::MinSegment {
                min_segment_secs,
                max_layer: args.max_layer,
            },
            None => bail!("--layer-policy min-segment requires --min-segment-secs"),
        },
    };
    Ok(policy)
}

fn build_counts(
    annotations_total: usize,
    output: &BuildOutput,
    train_records: usize,
    test_records: usize,
) -> BuildCounts {
    BuildCounts {
        annotations_total,
        videos_total: output.videos_total,
        videos_processed: output.videos_processed,
        records_built: output.records.len(),
        train_records,
        test_records,
        frames_extracted: output.frames_extracted,
        skipped_total: output.skipped.len(),
        skipped_video_not_found: output.skipped_count("video_not_found"),
        skipped_empty_annotation: output.skipped_count("empty_annotation"),
        skipped_out_of_bounds: output.skipped_count("out_of_bounds"),
        skipped_extraction_failed: output.skipped_count("extraction_failed"),
        skipped_duplicate_uid: output.skipped_count("duplicate_uid"),
    }
}

fn render_build_command(args: &BuildArgs) -> String {
    let mut command = vec![
        "video-grounding".to_string(),
        "build".to_string(),
        "--json_file".to_string(),
        args.json_file.display().to_string(),
        "--video_dir".to_string(),
        args.video_dir.display().to_string(),
        "--output_dir".to_string(),
        args.output_dir.display().to_string(),
        "--frames_per_min".to_string(),
        args.frames_per_min.to_string(),
        "--max-frames".to_string(),
        args.max_frames.to_string(),
        "--test-ratio".to_string(),
        args.test_ratio.to_string(),
        "--split-seed".to_string(),
        args.split_seed.to_string(),
        "--layer-policy".to_string(),
        args.layer_policy.as_str().to_string(),
    ];

    match args.layer_policy {
        LayerPolicyKind::BestIou => {
            command.push("--max-layer".to_string());
            command.push(args.max_layer.to_string());
            command.push("--granular-iou".to_string());
            command.push(args.granular_iou.to_string());
        }
        LayerPolicyKind::Fixed => {
            if let Some(layer) = args.fixed_layer {
                command.push("--fixed-layer".to_string());
                command.push(layer.to_string());
            }
        }
        LayerPolicyKind::MinSegment => {
            command.push("--max-layer".to_string());
            command.push(args.max_layer.to_string());
            if let Some(secs) = args.min_segment_secs {
                command.push("--min-segment-secs".to_string());
                command.push(secs.to_string());
            }
        }
    }

    command.push("--workers".to_string());
    command.push(args.workers.to_string());
    command.push("--video-timeout-secs".to_string());
    command.push(args.video_timeout_secs.to_string());
    command.push("--frame-width".to_string());
    command.push(args.frame_width.to_string());

    if let Some(path) = &args.prompt_template {
        command.push("--prompt-template".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.manifest_path {
        command.push("--manifest-path".to_string());
        command.push(path.display().to_string());
    }

    command.join(" ")
}
