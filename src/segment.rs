use serde::{Deserialize, Serialize};

/// Deepest layer a grounding may address; layer 32 already splits a video into 2^32 segments.
pub const MAX_LAYER: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: f64,
    pub end: f64,
}

impl TimeInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.start.is_finite() && self.end.is_finite()) || self.start >= self.end
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid layer {layer}: expected 0..={max}", max = MAX_LAYER)]
    InvalidLayer { layer: i64 },

    #[error("invalid segment {segment_id} at layer {layer}: expected 0..{count}")]
    InvalidSegment {
        layer: u32,
        segment_id: i64,
        count: u64,
    },

    #[error("invalid video duration: {0}")]
    InvalidDuration(f64),
}

/// A node of the implicit binary segmentation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentAddress {
    pub layer: u32,
    pub segment_id: u64,
}

impl SegmentAddress {
    pub fn new(layer: i64, segment_id: i64) -> Result<Self, SegmentError> {
        if layer < 0 || layer > i64::from(MAX_LAYER) {
            return Err(SegmentError::InvalidLayer { layer });
        }

        let layer = layer as u32;
        let count = segment_count(layer);
        if segment_id < 0 || segment_id as u64 >= count {
            return Err(SegmentError::InvalidSegment {
                layer,
                segment_id,
                count,
            });
        }

        Ok(Self {
            layer,
            segment_id: segment_id as u64,
        })
    }

    pub fn whole_video() -> Self {
        Self {
            layer: 0,
            segment_id: 0,
        }
    }

    pub fn interval(self, duration: f64) -> Result<TimeInterval, SegmentError> {
        let duration = validate_duration(duration)?;
        if self.layer > MAX_LAYER {
            return Err(SegmentError::InvalidLayer {
                layer: i64::from(self.layer),
            });
        }
        let count = segment_count(self.layer);
        if self.segment_id >= count {
            return Err(SegmentError::InvalidSegment {
                layer: self.layer,
                segment_id: self.segment_id as i64,
                count,
            });
        }

        let width = duration / count as f64;
        let start = self.segment_id as f64 * width;
        // (id + 1) * width rather than start + width keeps neighbouring boundaries bit-identical.
        let end = if self.segment_id + 1 == count {
            duration
        } else {
            ((self.segment_id + 1) as f64 * width).min(duration)
        };

        Ok(TimeInterval::new(start, end))
    }
}

/// Number of segments at `layer`; saturates for layers a `u64` cannot count.
pub fn segment_count(layer: u32) -> u64 {
    1_u64.checked_shl(layer).unwrap_or(u64::MAX)
}

pub fn segment_width(layer: u32, duration: f64) -> f64 {
    duration / segment_count(layer) as f64
}

pub fn validate_duration(duration: f64) -> Result<f64, SegmentError> {
    if duration.is_finite() && duration > 0.0 {
        Ok(duration)
    } else {
        Err(SegmentError::InvalidDuration(duration))
    }
}

/// Maps `(layer, segment_id)` to its half-open time interval within `[0, duration)`.
pub fn interval(layer: i64, segment_id: i64, duration: f64) -> Result<TimeInterval, SegmentError> {
    SegmentAddress::new(layer, segment_id)?.interval(duration)
}
