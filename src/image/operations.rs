use image::Luma;
use rayon::prelude::*;

use crate::error::{AlignmentError, Result};

use super::types::{ensure_non_empty, FrameImage, Image, Intensity, Mask};

/// Foreground (1) wherever the pixel is strictly greater than `threshold`.
pub fn binarize<T: Intensity>(image: &Image<T>, threshold: f64) -> Mask {
    let (width, height) = image.dimensions();
    let data: Vec<u8> = image
        .as_raw()
        .par_iter()
        .map(|p| u8::from(p.as_f64() > threshold))
        .collect();

    Mask::from_raw(width, height, data).unwrap_or_else(|| Mask::new(width, height))
}

pub fn invert_mask(mask: &Mask) -> Mask {
    let mut inverted = mask.clone();
    inverted.pixels_mut().for_each(|p| *p = Luma([1 - p[0].min(1)]));
    inverted
}

/// An even number of frames takes the mean of the two middle values.
pub fn median_frames(frames: &[FrameImage]) -> Result<Image<f32>> {
    let first = frames
        .first()
        .ok_or_else(|| AlignmentError::invalid("cannot take the median of zero frames"))?;
    let (width, height) = first.dimensions();

    if let Some(bad) = frames.iter().find(|f| f.dimensions() != (width, height)) {
        return Err(AlignmentError::invalid(format!(
            "frame shape {:?} does not match {:?}",
            bad.dimensions(),
            (width, height)
        )));
    }

    let planes: Vec<Image<f32>> = frames.iter().map(FrameImage::to_f32).collect();
    median_images(&planes)
}

pub fn median_images(planes: &[Image<f32>]) -> Result<Image<f32>> {
    let first = planes
        .first()
        .ok_or_else(|| AlignmentError::invalid("cannot take the median of zero images"))?;
    ensure_non_empty(first)?;
    let (width, height) = first.dimensions();
    if planes.iter().any(|p| p.dimensions() != (width, height)) {
        return Err(AlignmentError::invalid("image shapes differ"));
    }

    let num_pixels = (width * height) as usize;
    let data: Vec<f32> = (0..num_pixels)
        .into_par_iter()
        .map(|i| {
            let mut values: Vec<f32> = planes.iter().map(|p| p.as_raw()[i]).collect();
            values.sort_by(|a, b| a.total_cmp(b));
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        })
        .collect();

    Image::from_raw(width, height, data)
        .ok_or_else(|| AlignmentError::invalid("median produced the wrong pixel count"))
}
