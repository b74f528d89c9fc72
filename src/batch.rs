use crate::types::DataPoint;

/// Accumulates DataPoints in strict collection order and hands off a full
/// batch by value. A returned batch belongs entirely to the upload pipeline;
/// the assembler starts over with a fresh buffer.
pub struct BatchAssembler {
    batch_size: usize,
    points: Vec<DataPoint>,
}

impl BatchAssembler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            points: Vec::with_capacity(batch_size),
        }
    }

    /// Append one point; returns the filled batch when it reaches size.
    pub fn add(&mut self, point: DataPoint) -> Option<Vec<DataPoint>> {
        self.points.push(point);
        if self.points.len() >= self.batch_size {
            let full = std::mem::replace(&mut self.points, Vec::with_capacity(self.batch_size));
            Some(full)
        } else {
            None
        }
    }

    /// Whatever is pending, for the final partial flush at shutdown.
    pub fn take_partial(&mut self) -> Vec<DataPoint> {
        std::mem::take(&mut self.points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
