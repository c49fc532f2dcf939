use std::collections::{BTreeMap, HashMap};
use std::fs;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use video_grounding::dataset::TrainingRecord;
use video_grounding::grounding::GroundingParser;
use video_grounding::model::{ScoreReport, ScoredResponse};
use video_grounding::reward::{self, RewardConfig, ScoreRequest, score_batch};
use video_grounding::sampling::{GroundingPlan, plan_grounding_frames};
use video_grounding::store;
use video_grounding::util::{now_utc_string, write_json_pretty};
use video_grounding::video::VideoMeta;

use crate::cli::ScoreArgs;

#[derive(Debug, Clone, Deserialize)]
struct ResponseLine {
    record_id: String,
    response: String,
}

pub fn run(args: ScoreArgs) -> Result<()> {
    if args.workers == 0 {
        bail!("worker count must be at least 1");
    }
    if args.max_frames == 0 {
        bail!("max frames must be at least 1");
    }

    let config = match &args.reward_config {
        Some(path) => RewardConfig::from_json_file(path)?,
        None => RewardConfig::default(),
    };
    let reward_fn = reward::by_name(&args.reward, config.clone())
        .context("failed to compile grounding answer patterns")?
        .with_context(|| format!("unknown reward function: {}", args.reward))?;

    let records = store::load_records(&args.split_path, false)?;
    let by_id: HashMap<&str, &TrainingRecord> = records
        .iter()
        .map(|record| (record.record_id.as_str(), record))
        .collect();

    let responses = read_responses(&args.responses)?;
    info!(
        records = records.len(),
        responses = responses.len(),
        reward = reward_fn.name(),
        "scoring responses"
    );

    let mut unknown_record_ids = Vec::new();
    let mut matched = Vec::new();
    for line in &responses {
        match by_id.get(line.record_id.as_str()) {
            Some(record) => matched.push((line, *record, record.target())),
            None => {
                warn!(record_id = %line.record_id, "response references an unknown record");
                unknown_record_ids.push(line.record_id.clone());
            }
        }
    }
    if matched.is_empty() {
        bail!(
            "none of the {} responses match a record in {}",
            responses.len(),
            args.split_path.display()
        );
    }

    let requests = matched
        .iter()
        .map(|(line, record, target)| ScoreRequest {
            response: line.response.as_str(),
            target,
            video: &record.video,
        })
        .collect::<Vec<_>>();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.workers)
        .build()
        .context("failed to start scoring pool")?;
    let results = pool.install(|| score_batch(reward_fn.as_ref(), &requests));

    let parser = GroundingParser::new().context("failed to compile grounding answer patterns")?;
    let scored = matched
        .iter()
        .zip(results)
        .map(|((line, record, _), result)| ScoredResponse {
            record_id: line.record_id.clone(),
            plan: plan_for(&parser, &line.response, &record.video, args.max_frames),
            result,
        })
        .collect::<Vec<_>>();

    let summary = summarize(&scored);
    let report_path = args
        .report_path
        .clone()
        .unwrap_or_else(|| args.split_path.with_extension("score_report.json"));

    let report = ScoreReport {
        manifest_version: 1,
        generated_at: now_utc_string(),
        reward_name: reward_fn.name().to_string(),
        split_path: args.split_path.display().to_string(),
        responses_path: args.responses.display().to_string(),
        config,
        scored: scored.len(),
        unknown_record_ids,
        mean_reward: summary.mean_reward,
        mean_iou: summary.mean_iou,
        format_ok_rate: summary.format_ok_rate,
        failures_by_kind: summary.failures_by_kind,
        results: scored,
    };

    write_json_pretty(&report_path, &report)?;
    info!(path = %report_path.display(), "wrote score report");
    info!(
        scored = report.scored,
        mean_reward = report.mean_reward,
        mean_iou = report.mean_iou,
        format_ok_rate = report.format_ok_rate,
        "scoring completed"
    );

    Ok(())
}

fn plan_for(
    parser: &GroundingParser,
    response: &str,
    video: &VideoMeta,
    max_frames: usize,
) -> Option<GroundingPlan> {
    let answer = parser.parse(response).ok()?;
    plan_grounding_frames(video, &answer, max_frames).ok()
}

fn read_responses(path: &std::path::Path) -> Result<Vec<ResponseLine>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read responses: {}", path.display()))?;

    let mut responses = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ResponseLine = serde_json::from_str(line).with_context(|| {
            format!("failed to parse line {} of {}", index + 1, path.display())
        })?;
        responses.push(parsed);
    }

    Ok(responses)
}

#[derive(Debug, Default, PartialEq)]
struct ScoreSummary {
    mean_reward: f64,
    mean_iou: f64,
    format_ok_rate: f64,
    failures_by_kind: BTreeMap<String, usize>,
}

fn summarize(scored: &[ScoredResponse]) -> ScoreSummary {
    if scored.is_empty() {
        return ScoreSummary::default();
    }

    let count = scored.len() as f64;
    let mut summary = ScoreSummary::default();
    for item in scored {
        summary.mean_reward += item.result.reward;
        summary.mean_iou += item.result.iou;
        if item.result.format_ok {
            summary.format_ok_rate += 1.0;
        }
        if let Some(failure) = &item.result.failure {
            *summary
                .failures_by_kind
                .entry(failure.code().to_string())
                .or_insert(0) += 1;
        }
    }
    summary.mean_reward /= count;
    summary.mean_iou /= count;
    summary.format_ok_rate /= count;
    summary
}
