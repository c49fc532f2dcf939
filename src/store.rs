//! Training files: one Parquet file per split, one row per record. Frames are a
//! `list<binary>` column of JPEG blobs next to their source indices and timestamps.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, ArrayRef, AsArray, BinaryBuilder, Float64Array, Float64Builder, ListArray,
    ListBuilder, StringArray, StringBuilder, UInt32Builder, UInt64Builder,
};
use arrow::datatypes::{Float64Type, UInt32Type, UInt64Type};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::annotation::Split;
use crate::dataset::TrainingRecord;
use crate::segment::{SegmentAddress, TimeInterval};
use crate::video::{ExtractedFrame, VideoMeta};

pub const IMAGES_COLUMN: &str = "images";

pub fn split_path(output_dir: &Path, split: Split) -> PathBuf {
    output_dir.join(format!("{}.parquet", split.as_str()))
}

/// Replaces `path` with a Parquet file holding `records` and their frames.
pub fn write_split(path: &Path, records: &[&TrainingRecord]) -> Result<usize> {
    let batch = records_to_batch(records)?;

    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(properties))
        .with_context(|| format!("failed to start parquet writer for {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("failed to write records to {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("failed to finalize {}", path.display()))?;

    Ok(records.len())
}

fn records_to_batch(records: &[&TrainingRecord]) -> Result<RecordBatch> {
    let mut record_id = StringBuilder::new();
    let mut split = StringBuilder::new();
    let mut prompt = StringBuilder::new();
    let mut question = StringBuilder::new();
    let mut answer = StringBuilder::new();
    let mut layer = UInt32Builder::new();
    let mut segment_id = UInt64Builder::new();
    let mut grounding_iou = Float64Builder::new();
    let mut gt_start = Float64Builder::new();
    let mut gt_end = Float64Builder::new();
    let mut video_id = StringBuilder::new();
    let mut duration_secs = Float64Builder::new();
    let mut native_fps = Float64Builder::new();
    let mut time_reference = StringBuilder::new();
    let mut reference_answer = StringBuilder::new();
    let mut images = ListBuilder::new(BinaryBuilder::new());
    let mut frame_indices = ListBuilder::new(UInt64Builder::new());
    let mut frame_timestamps = ListBuilder::new(Float64Builder::new());

    for record in records {
        record_id.append_value(&record.record_id);
        split.append_value(record.split.as_str());
        prompt.append_value(&record.prompt);
        question.append_value(&record.question);
        answer.append_value(&record.answer);
        layer.append_value(record.grounding.layer);
        segment_id.append_value(record.grounding.segment_id);
        grounding_iou.append_value(record.grounding_iou);
        gt_start.append_value(record.ground_truth.start);
        gt_end.append_value(record.ground_truth.end);
        video_id.append_value(&record.video.video_id);
        duration_secs.append_value(record.video.duration_secs);
        native_fps.append_value(record.video.native_fps);
        time_reference.append_value(&record.time_reference);
        reference_answer.append_value(&record.reference_answer);

        for frame in record.frames.iter() {
            images.values().append_value(&frame.jpeg);
            frame_indices.values().append_value(frame.frame_index);
            frame_timestamps.values().append_value(frame.timestamp_secs);
        }
        images.append(true);
        frame_indices.append(true);
        frame_timestamps.append(true);
    }

    let columns: Vec<(&str, ArrayRef)> = vec![
        ("record_id", Arc::new(record_id.finish())),
        ("split", Arc::new(split.finish())),
        ("prompt", Arc::new(prompt.finish())),
        ("question", Arc::new(question.finish())),
        (IMAGES_COLUMN, Arc::new(images.finish())),
        ("frame_indices", Arc::new(frame_indices.finish())),
        ("frame_timestamps", Arc::new(frame_timestamps.finish())),
        ("answer", Arc::new(answer.finish())),
        ("layer", Arc::new(layer.finish())),
        ("segment_id", Arc::new(segment_id.finish())),
        ("grounding_iou", Arc::new(grounding_iou.finish())),
        ("gt_start", Arc::new(gt_start.finish())),
        ("gt_end", Arc::new(gt_end.finish())),
        ("video_id", Arc::new(video_id.finish())),
        ("duration_secs", Arc::new(duration_secs.finish())),
        ("native_fps", Arc::new(native_fps.finish())),
        ("time_reference", Arc::new(time_reference.finish())),
        ("reference_answer", Arc::new(reference_answer.finish())),
    ];

    RecordBatch::try_from_iter(columns).context("failed to assemble record batch")
}

fn open_reader(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    if !path.exists() {
        bail!("split file does not exist: {}", path.display());
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata of {}", path.display()))
}

pub fn count_records(path: &Path) -> Result<i64> {
    let builder = open_reader(path)?;
    Ok(builder.metadata().file_metadata().num_rows())
}

/// Total number of stored frames, reading only the frame-index column.
pub fn count_frames(path: &Path) -> Result<usize> {
    let builder = open_reader(path)?;
    let column = builder
        .schema()
        .index_of("frame_indices")
        .with_context(|| format!("{} has no frame_indices column", path.display()))?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [column]);
    let reader = builder
        .with_projection(mask)
        .build()
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut frames = 0;
    for batch in reader {
        let batch = batch.with_context(|| format!("failed to decode {}", path.display()))?;
        let lists = batch
            .column(0)
            .as_list_opt::<i32>()
            .context("frame_indices is not a list column")?;
        frames += (0..lists.len())
            .map(|row| lists.value_length(row) as usize)
            .sum::<usize>();
    }

    Ok(frames)
}

/// Loads every record in file order; frames only when `with_frames` is set.
pub fn load_records(path: &Path, with_frames: bool) -> Result<Vec<TrainingRecord>> {
    let reader = open_reader(path)?
        .build()
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("failed to decode {}", path.display()))?;
        append_records(&batch, with_frames, &mut records)
            .with_context(|| format!("malformed records in {}", path.display()))?;
    }

    Ok(records)
}

fn append_records(
    batch: &RecordBatch,
    with_frames: bool,
    records: &mut Vec<TrainingRecord>,
) -> Result<()> {
    let record_id = string_column(batch, "record_id")?;
    let split = string_column(batch, "split")?;
    let prompt = string_column(batch, "prompt")?;
    let question = string_column(batch, "question")?;
    let answer = string_column(batch, "answer")?;
    let video_id = string_column(batch, "video_id")?;
    let time_reference = string_column(batch, "time_reference")?;
    let reference_answer = string_column(batch, "reference_answer")?;
    let layer = batch_column(batch, "layer")?
        .as_primitive_opt::<UInt32Type>()
        .context("layer is not a u32 column")?;
    let segment_id = batch_column(batch, "segment_id")?
        .as_primitive_opt::<UInt64Type>()
        .context("segment_id is not a u64 column")?;
    let grounding_iou = float_column(batch, "grounding_iou")?;
    let gt_start = float_column(batch, "gt_start")?;
    let gt_end = float_column(batch, "gt_end")?;
    let duration_secs = float_column(batch, "duration_secs")?;
    let native_fps = float_column(batch, "native_fps")?;

    for row in 0..batch.num_rows() {
        let frames = if with_frames {
            row_frames(batch, row)?
        } else {
            Vec::new()
        };
        let split_name = split.value(row);

        records.push(TrainingRecord {
            record_id: record_id.value(row).to_string(),
            split: Split::parse(split_name)
                .with_context(|| format!("unknown split {split_name:?}"))?,
            question: question.value(row).to_string(),
            prompt: prompt.value(row).to_string(),
            answer: answer.value(row).to_string(),
            grounding: SegmentAddress {
                layer: layer.value(row),
                segment_id: segment_id.value(row),
            },
            grounding_iou: grounding_iou.value(row),
            ground_truth: TimeInterval::new(gt_start.value(row), gt_end.value(row)),
            time_reference: time_reference.value(row).to_string(),
            reference_answer: reference_answer.value(row).to_string(),
            video: VideoMeta {
                video_id: video_id.value(row).to_string(),
                duration_secs: duration_secs.value(row),
                native_fps: native_fps.value(row),
            },
            frames: Arc::new(frames),
        });
    }

    Ok(())
}

fn row_frames(batch: &RecordBatch, row: usize) -> Result<Vec<ExtractedFrame>> {
    let images = list_column(batch, IMAGES_COLUMN)?.value(row);
    let images = images
        .as_binary_opt::<i32>()
        .context("images is not a list<binary> column")?;
    let indices = list_column(batch, "frame_indices")?.value(row);
    let indices = indices
        .as_primitive_opt::<UInt64Type>()
        .context("frame_indices is not a list<u64> column")?;
    let timestamps = list_column(batch, "frame_timestamps")?.value(row);
    let timestamps = timestamps
        .as_primitive_opt::<Float64Type>()
        .context("frame_timestamps is not a list<f64> column")?;

    if images.len() != indices.len() || images.len() != timestamps.len() {
        bail!("frame columns disagree in length at row {row}");
    }

    Ok((0..images.len())
        .map(|frame| ExtractedFrame {
            frame_index: indices.value(frame),
            timestamp_secs: timestamps.value(frame),
            jpeg: images.value(frame).to_vec(),
        })
        .collect())
}

fn batch_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch_column(batch, name)?
        .as_string_opt::<i32>()
        .with_context(|| format!("{name} is not a string column"))
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    batch_column(batch, name)?
        .as_primitive_opt::<Float64Type>()
        .with_context(|| format!("{name} is not an f64 column"))
}

fn list_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ListArray> {
    batch_column(batch, name)?
        .as_list_opt::<i32>()
        .with_context(|| format!("{name} is not a list column"))
}
