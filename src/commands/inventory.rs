use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use video_grounding::model::{VideoEntry, VideoInventoryManifest};
use video_grounding::util::{now_utc_string, sha256_file, write_json_pretty};
use video_grounding::video::{FfmpegFrameSource, FrameSource, is_video_file};

use crate::cli::InventoryArgs;

const PROBE_FRAME_WIDTH: u32 = 448;

pub fn run(args: InventoryArgs) -> Result<()> {
    if args.video_timeout_secs == 0 {
        bail!("video timeout must be at least one second");
    }

    let source = FfmpegFrameSource::new(
        Duration::from_secs(args.video_timeout_secs),
        PROBE_FRAME_WIDTH,
    );
    let manifest = build_manifest(&args.video_dir, &source)?;

    if args.dry_run {
        info!(
            video_count = manifest.video_count,
            probe_failures = manifest.probe_failures,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| args.video_dir.join("video_inventory.json"));

    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(
        video_count = manifest.video_count,
        probe_failures = manifest.probe_failures,
        "inventory completed"
    );

    Ok(())
}

pub fn build_manifest(video_dir: &Path, source: &dyn FrameSource) -> Result<VideoInventoryManifest> {
    let mut video_paths = discover_videos(video_dir)?;
    video_paths.sort();

    if video_paths.is_empty() {
        bail!("no videos found in {}", video_dir.display());
    }

    let mut videos = Vec::with_capacity(video_paths.len());
    for path in video_paths {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;
        let video_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(ToOwned::to_owned)
            .with_context(|| format!("invalid UTF-8 file stem: {}", path.display()))?;
        let sha256 = sha256_file(&path)?;

        let entry = match source.probe(&video_id, &path) {
            Ok(meta) => VideoEntry {
                filename,
                video_id,
                duration_secs: Some(meta.duration_secs),
                native_fps: Some(meta.native_fps),
                sha256,
                probe_error: None,
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to probe video");
                VideoEntry {
                    filename,
                    video_id,
                    duration_secs: None,
                    native_fps: None,
                    sha256,
                    probe_error: Some(err.to_string()),
                }
            }
        };
        videos.push(entry);
    }

    let probe_failures = videos
        .iter()
        .filter(|video| video.probe_error.is_some())
        .count();

    Ok(VideoInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: video_dir.display().to_string(),
        video_count: videos.len(),
        probe_failures,
        videos,
    })
}

fn discover_videos(video_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut videos = Vec::new();

    let entries = fs::read_dir(video_dir)
        .with_context(|| format!("failed to read {}", video_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", video_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        if is_video_file(&path) {
            videos.push(path);
        }
    }

    Ok(videos)
}

#[cfg(test)]
mod tests {
    use video_grounding::sampling::FramePlan;
    use video_grounding::video::{ExtractedFrame, VideoError, VideoMeta};

    use super::*;

    struct StubSource;

    impl FrameSource for StubSource {
        fn probe(&self, video_id: &str, _path: &Path) -> Result<VideoMeta, VideoError> {
            if video_id == "corrupt" {
                return Err(VideoError::Probe("no video stream".to_string()));
            }
            Ok(VideoMeta {
                video_id: video_id.to_string(),
                duration_secs: 90.0,
                native_fps: 30.0,
            })
        }

        fn extract_frames(
            &self,
            _path: &Path,
            _plan: &FramePlan,
        ) -> Result<Vec<ExtractedFrame>, VideoError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn inventory_probes_videos_and_records_failures() {
        let dir = std::env::temp_dir().join(format!(
            "video_grounding_inventory_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("create dir");
        fs::write(dir.join("b_match.MP4"), b"video-b").expect("write video");
        fs::write(dir.join("a_match.webm"), b"video-a").expect("write video");
        fs::write(dir.join("corrupt.mkv"), b"garbage").expect("write video");
        fs::write(dir.join("notes.txt"), b"not a video").expect("write text");

        let manifest = build_manifest(&dir, &StubSource).expect("manifest");
        let names = manifest
            .videos
            .iter()
            .map(|video| video.filename.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a_match.webm", "b_match.MP4", "corrupt.mkv"]);
        assert_eq!(manifest.video_count, 3);
        assert_eq!(manifest.probe_failures, 1);
        assert_eq!(manifest.videos[0].video_id, "a_match");
        assert_eq!(manifest.videos[0].duration_secs, Some(90.0));
        assert!(manifest.videos[2].probe_error.is_some());
        assert_eq!(manifest.videos[0].sha256.len(), 64);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn inventory_of_a_directory_without_videos_fails() {
        let dir = std::env::temp_dir().join(format!(
            "video_grounding_inventory_empty_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&dir).expect("create dir");

        assert!(build_manifest(&dir, &StubSource).is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
