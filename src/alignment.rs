use serde::{Deserialize, Serialize};

use crate::segment::{
    MAX_LAYER, SegmentAddress, SegmentError, TimeInterval, segment_count, segment_width,
    validate_duration,
};

/// Intersection-over-union of two time intervals; 0 when the union is empty.
pub fn overlap(a: TimeInterval, b: TimeInterval) -> f64 {
    let intersection = (a.end.min(b.end) - a.start.max(b.start)).max(0.0);
    let union = a.length() + b.length() - intersection;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }
    (intersection / union).clamp(0.0, 1.0)
}

/// Picks the segment at `layer` with maximal IoU against `target`, lowest id on ties.
pub fn align(target: TimeInterval, duration: f64, layer: u32) -> Result<u64, SegmentError> {
    Ok(align_with_iou(target, duration, layer)?.0)
}

fn align_with_iou(
    target: TimeInterval,
    duration: f64,
    layer: u32,
) -> Result<(u64, f64), SegmentError> {
    let duration = validate_duration(duration)?;
    if layer > MAX_LAYER {
        return Err(SegmentError::InvalidLayer {
            layer: i64::from(layer),
        });
    }

    let count = segment_count(layer);
    let width = segment_width(layer, duration);

    // Only segments touching the target can have a non-zero IoU; pad by one against rounding.
    let first = candidate_index(target.start / width, count).saturating_sub(1);
    let last = candidate_index(target.end / width, count)
        .saturating_add(1)
        .min(count - 1);

    let mut best_segment = 0_u64;
    let mut best_iou = 0.0_f64;
    for segment_id in first..=last {
        let candidate = SegmentAddress { layer, segment_id }.interval(duration)?;
        let iou = overlap(target, candidate);
        if iou > best_iou {
            best_iou = iou;
            best_segment = segment_id;
        }
    }

    Ok((best_segment, best_iou))
}

fn candidate_index(position: f64, count: u64) -> u64 {
    if !position.is_finite() || position <= 0.0 {
        return 0;
    }
    (position.floor() as u64).min(count - 1)
}

/// How the dataset builder chooses the layer at which ground truth is stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum LayerPolicy {
    /// Best IoU over layers `0..=max_layer`, moving to a finer layer whenever
    /// it still reaches `granular_iou`.
    BestIou { max_layer: u32, granular_iou: f64 },
    Fixed { layer: u32 },
    /// Finest layer whose segments are at least `min_segment_secs` long.
    MinSegment { min_segment_secs: f64, max_layer: u32 },
}

impl Default for LayerPolicy {
    fn default() -> Self {
        Self::BestIou {
            max_layer: 4,
            granular_iou: 0.7,
        }
    }
}

impl LayerPolicy {
    pub fn deepest_layer(&self) -> u32 {
        match *self {
            Self::BestIou { max_layer, .. } | Self::MinSegment { max_layer, .. } => max_layer,
            Self::Fixed { layer } => layer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanonicalGrounding {
    pub address: SegmentAddress,
    pub iou: f64,
}

pub fn canonical_grounding(
    target: TimeInterval,
    duration: f64,
    policy: LayerPolicy,
) -> Result<CanonicalGrounding, SegmentError> {
    let layer = match policy {
        LayerPolicy::Fixed { layer } => layer,
        LayerPolicy::MinSegment {
            min_segment_secs,
            max_layer,
        } => finest_layer_with_min_width(duration, min_segment_secs, max_layer),
        LayerPolicy::BestIou {
            max_layer,
            granular_iou,
        } => return best_iou_grounding(target, duration, max_layer, granular_iou),
    };

    let (segment_id, iou) = align_with_iou(target, duration, layer)?;
    Ok(CanonicalGrounding {
        address: SegmentAddress { layer, segment_id },
        iou,
    })
}

fn best_iou_grounding(
    target: TimeInterval,
    duration: f64,
    max_layer: u32,
    granular_iou: f64,
) -> Result<CanonicalGrounding, SegmentError> {
    let mut best = CanonicalGrounding {
        address: SegmentAddress::whole_video(),
        iou: 0.0,
    };

    for layer in 0..=max_layer.min(MAX_LAYER) {
        let (segment_id, iou) = align_with_iou(target, duration, layer)?;
        if iou <= 0.0 {
            continue;
        }
        if iou > best.iou || (iou >= granular_iou && layer > best.address.layer) {
            best = CanonicalGrounding {
                address: SegmentAddress { layer, segment_id },
                iou,
            };
        }
    }

    Ok(best)
}

pub fn finest_layer_with_min_width(duration: f64, min_segment_secs: f64, max_layer: u32) -> u32 {
    let mut layer = 0_u32;
    while layer < max_layer.min(MAX_LAYER) && segment_width(layer + 1, duration) >= min_segment_secs
    {
        layer += 1;
    }
    layer
}
