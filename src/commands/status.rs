use anyhow::Result;
use tracing::{info, warn};

use video_grounding::annotation::Split;
use video_grounding::model::BuildRunManifest;
use video_grounding::store;
use video_grounding::util::read_json;

use crate::cli::StatusArgs;
use crate::commands::BUILD_MANIFEST_FILE;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_path = args.output_dir.join(BUILD_MANIFEST_FILE);

    info!(output_dir = %args.output_dir.display(), "status requested");

    if manifest_path.exists() {
        let manifest: BuildRunManifest = read_json(&manifest_path)?;
        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            started_at = %manifest.started_at,
            updated_at = %manifest.updated_at,
            annotations = manifest.counts.annotations_total,
            records = manifest.counts.records_built,
            train = manifest.counts.train_records,
            test = manifest.counts.test_records,
            skipped = manifest.counts.skipped_total,
            videos = manifest.counts.videos_processed,
            frames = manifest.counts.frames_extracted,
            ffmpeg = %manifest.tool_versions.ffmpeg.unwrap_or_default(),
            "loaded build manifest"
        );
    } else {
        warn!(path = %manifest_path.display(), "build manifest missing");
    }

    for split in [Split::Train, Split::Test] {
        let path = store::split_path(&args.output_dir, split);
        if !path.exists() {
            warn!(path = %path.display(), split = split.as_str(), "split file missing");
            continue;
        }

        let records = store::count_records(&path)?;
        let frames = store::count_frames(&path)?;
        info!(
            path = %path.display(),
            split = split.as_str(),
            records,
            frames,
            "split status"
        );
    }

    Ok(())
}
