use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::segment::TimeInterval;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" | "training" => Some(Self::Train),
            "test" | "validation" | "val" | "eval" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AnnotationDocument {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    qa: Vec<QaEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct QaEntry {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    time_reference: String,
    #[serde(default)]
    split: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthAnnotation {
    pub uid: String,
    pub video_id: String,
    pub question: String,
    pub answer: String,
    pub time_reference: String,
    /// `None` when the time reference could not be read.
    pub interval: Option<TimeInterval>,
    pub split: Option<Split>,
}

/// Loads every annotation from a JSON file, or from each `*.json` file of a directory.
pub fn load_annotations(path: &Path) -> Result<Vec<GroundTruthAnnotation>> {
    let files = if path.is_dir() {
        discover_json_files(path)?
    } else if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        bail!("annotation input does not exist: {}", path.display());
    };

    if files.is_empty() {
        bail!("no annotation JSON files found in {}", path.display());
    }

    let mut annotations = Vec::new();
    for file in files {
        annotations.extend(load_annotation_file(&file)?);
    }
    Ok(annotations)
}

fn discover_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json && path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn load_annotation_file(path: &Path) -> Result<Vec<GroundTruthAnnotation>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let documents: Vec<AnnotationDocument> = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|document| vec![document])
    }
    .with_context(|| format!("unexpected annotation layout in {}", path.display()))?;

    let stem = path
        .file_stem()
        .and_then(|name| name.to_str())
        .unwrap_or("video")
        .to_string();

    let mut annotations = Vec::new();
    for document in documents {
        let video_id = document
            .key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| stem.clone());

        for (index, qa) in document.qa.into_iter().enumerate() {
            annotations.push(GroundTruthAnnotation {
                uid: qa
                    .uid
                    .filter(|uid| !uid.trim().is_empty())
                    .unwrap_or_else(|| format!("{video_id}-{index}")),
                video_id: video_id.clone(),
                interval: parse_time_reference(&qa.time_reference),
                split: qa.split.as_deref().and_then(Split::parse),
                question: qa.question,
                answer: qa.answer,
                time_reference: qa.time_reference,
            });
        }
    }

    Ok(annotations)
}

/// Reads `"MM:SS-MM:SS"`, `"HH:MM:SS-HH:MM:SS"` or plain seconds (`"12.5-30"`).
pub fn parse_time_reference(value: &str) -> Option<TimeInterval> {
    let (start, end) = value.trim().split_once('-')?;
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    Some(TimeInterval::new(start, end))
}

fn parse_timestamp(value: &str) -> Option<f64> {
    let parts = value.trim().split(':').collect::<Vec<&str>>();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let (seconds, larger_units) = parts.split_last()?;
    let mut total = seconds.trim().parse::<f64>().ok()?;
    if !total.is_finite() || total < 0.0 {
        return None;
    }

    let mut scale = 60.0;
    for unit in larger_units.iter().rev() {
        let amount = unit.trim().parse::<u32>().ok()?;
        total += f64::from(amount) * scale;
        scale *= 60.0;
    }

    Some(total)
}
