use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    alignment::STACK_SIZE,
    error::{AlignmentError, Result},
    image::{FrameImage, Image},
};

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    /// Epoch of the last command the scanner had seen, when it echoes one.
    pub epoch: Option<u64>,
    pub image: FrameImage,
}

impl Frame {
    pub fn new(timestamp: DateTime<Utc>, image: impl Into<FrameImage>) -> Self {
        Self {
            timestamp,
            epoch: None,
            image: image.into(),
        }
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

/// Median planes around the nominal focal plane, lowest offset first:
/// `[-2, -1, 0, +1, +2]` spacings.
#[derive(Clone, Debug)]
pub struct ZStack {
    planes: [Image<f32>; STACK_SIZE],
}

impl ZStack {
    pub fn new(planes: [Image<f32>; STACK_SIZE]) -> Result<Self> {
        let dimensions = planes[0].dimensions();
        if planes.iter().any(|p| p.dimensions() != dimensions) {
            return Err(AlignmentError::invalid("stack planes differ in shape"));
        }
        Ok(Self { planes })
    }

    /// `below` and `above` are in acquisition order, nearest plane first.
    pub fn from_parts(
        below: [Image<f32>; 2],
        target: Image<f32>,
        above: [Image<f32>; 2],
    ) -> Result<Self> {
        let [below_near, below_far] = below;
        let [above_near, above_far] = above;
        Self::new([below_far, below_near, target, above_near, above_far])
    }

    pub fn planes(&self) -> &[Image<f32>] {
        &self.planes
    }

    pub fn center(&self) -> &Image<f32> {
        &self.planes[STACK_SIZE / 2]
    }

    pub fn into_planes(self) -> Vec<Image<f32>> {
        self.planes.into()
    }

    pub fn offsets(spacing: f64) -> [f64; STACK_SIZE] {
        let mut offsets = [0.0; STACK_SIZE];
        for (n, offset) in offsets.iter_mut().enumerate() {
            *offset = (n as f64 - (STACK_SIZE / 2) as f64) * spacing;
        }
        offsets
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CutOutcome {
    Trimmed(usize),
    /// Every stored frame predated the reference; the buffer was cleared.
    Stale(usize),
}

impl CutOutcome {
    pub fn removed(&self) -> usize {
        match self {
            CutOutcome::Trimmed(n) | CutOutcome::Stale(n) => *n,
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn plane(value: f32) -> Image<f32> {
        Image::from_pixel(2, 2, Luma([value]))
    }

    #[test]
    fn test_stack_order() {
        let stack = ZStack::from_parts(
            [plane(-1.0), plane(-2.0)],
            plane(0.0),
            [plane(1.0), plane(2.0)],
        )
        .unwrap();

        let values: Vec<f32> = stack.planes().iter().map(|p| p.get_pixel(0, 0)[0]).collect();
        assert_eq!(values, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(stack.center().get_pixel(0, 0)[0], 0.0);
        assert_eq!(ZStack::offsets(3.0), [-6.0, -3.0, 0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_stack_rejects_mixed_shapes() {
        let odd = Image::from_pixel(3, 2, Luma([0.0]));
        assert!(ZStack::new([plane(0.0), plane(0.0), odd, plane(0.0), plane(0.0)]).is_err());
    }
}
