use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{AlignmentError, Result};

use super::types::{ensure_non_empty, Image, Intensity};

pub const DEFAULT_NUM_BINS: usize = 256;

// Upper bound for one-bin-per-value histograms of integer images.
const MAX_COUNTING_BINS: i64 = 1 << 24;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceRange {
    Image,
    Dtype,
}

impl FromStr for SourceRange {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(SourceRange::Image),
            "dtype" => Ok(SourceRange::Dtype),
            other => Err(AlignmentError::invalid(format!(
                "Incorrect value for `source_range` argument: {other}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Histogram {
    pub counts: Vec<u64>,
    pub bin_centers: Vec<f64>,
}

impl Histogram {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HistogramInput {
    /// Bare counts; bin centers default to the bin indices.
    Counts(Vec<f64>),
    Full(Histogram),
}

impl From<Histogram> for HistogramInput {
    fn from(histogram: Histogram) -> Self {
        HistogramInput::Full(histogram)
    }
}

impl HistogramInput {
    fn into_parts(self) -> (Vec<f64>, Vec<f64>) {
        match self {
            HistogramInput::Counts(counts) => {
                let centers = (0..counts.len()).map(|i| i as f64).collect();
                (counts, centers)
            }
            HistogramInput::Full(histogram) => (
                histogram.counts.iter().map(|&c| c as f64).collect(),
                histogram.bin_centers,
            ),
        }
    }
}

/// Intensity histogram of `image`.
///
/// Integer images get one bin per integer value between the range limits,
/// unless that range is too wide to count, in which case they are binned like
/// floating images: `num_bins` bins of equal width. Values outside the range
/// are not counted.
pub fn histogram<T: Intensity>(
    image: &Image<T>,
    num_bins: usize,
    source_range: SourceRange,
) -> Result<Histogram> {
    ensure_non_empty(image)?;

    if T::DTYPE.is_integer() {
        counting_histogram(image, num_bins, source_range)
    } else {
        binned_histogram(image, num_bins, source_range)
    }
}

fn observed_range<T: Intensity>(image: &Image<T>) -> (f64, f64) {
    image
        .iter()
        .map(|p| p.as_f64())
        .filter(|v| !v.is_nan())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

fn counting_histogram<T: Intensity>(
    image: &Image<T>,
    num_bins: usize,
    source_range: SourceRange,
) -> Result<Histogram> {
    let (min, max) = match source_range {
        SourceRange::Image => observed_range(image),
        SourceRange::Dtype => T::DTYPE.limits(),
    };
    let (min, max) = (min as i64, max as i64);

    let span = max - min + 1;
    if span > MAX_COUNTING_BINS {
        debug!("{span} values between {min} and {max}, binning into {num_bins}");
        return binned_histogram(image, num_bins, source_range);
    }

    // Offsetting by the minimum keeps negative values countable.
    let counts = image
        .iter()
        .fold(vec![0u64; span as usize], |mut counts, &value| {
            let bin = value.as_f64() as i64 - min;
            counts[bin as usize] += 1;
            counts
        });
    let bin_centers = (min..=max).map(|v| v as f64).collect();

    Ok(Histogram {
        counts,
        bin_centers,
    })
}

fn binned_histogram<T: Intensity>(
    image: &Image<T>,
    num_bins: usize,
    source_range: SourceRange,
) -> Result<Histogram> {
    if num_bins == 0 {
        return Err(AlignmentError::invalid("num_bins must be at least 1"));
    }

    let (mut lo, mut hi) = match source_range {
        SourceRange::Image => observed_range(image),
        SourceRange::Dtype => T::DTYPE.limits(),
    };
    if !lo.is_finite() || !hi.is_finite() {
        return Err(AlignmentError::invalid("image has no finite pixel values"));
    }
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let width = (hi - lo) / num_bins as f64;
    let mut counts = vec![0u64; num_bins];
    for value in image.iter().map(|p| p.as_f64()) {
        if value.is_nan() || value < lo || value > hi {
            continue;
        }
        // The last bin is closed on the right.
        let bin = (((value - lo) / width) as usize).min(num_bins - 1);
        counts[bin] += 1;
    }
    let bin_centers = (0..num_bins)
        .map(|i| lo + (i as f64 + 0.5) * width)
        .collect();

    Ok(Histogram {
        counts,
        bin_centers,
    })
}

pub fn threshold_mean<T: Intensity>(image: &Image<T>) -> Result<f64> {
    ensure_non_empty(image)?;
    let sum: f64 = image.iter().map(|p| p.as_f64()).sum();
    Ok(sum / image.len() as f64)
}

pub fn threshold_otsu<T: Intensity>(
    image: Option<&Image<T>>,
    hist: Option<HistogramInput>,
) -> Result<T> {
    threshold_otsu_bins(image, hist, DEFAULT_NUM_BINS)
}

/// Threshold maximizing the between-class variance of the histogram.
///
/// Pixels strictly greater than the returned value are foreground. When `hist`
/// is given the image histogram is not computed. A single-valued image returns
/// that value directly.
pub fn threshold_otsu_bins<T: Intensity>(
    image: Option<&Image<T>>,
    hist: Option<HistogramInput>,
    num_bins: usize,
) -> Result<T> {
    if let Some(image) = image {
        ensure_non_empty(image)?;
        let first = image.as_raw()[0];
        if image.iter().all(|&p| p == first) {
            return Ok(first);
        }
    }

    let (counts, bin_centers) = match (hist, image) {
        (Some(hist), _) => hist.into_parts(),
        (None, Some(image)) => {
            HistogramInput::Full(histogram(image, num_bins, SourceRange::Image)?).into_parts()
        }
        (None, None) => {
            return Err(AlignmentError::invalid(
                "Either image or hist must be provided.",
            ))
        }
    };

    if counts.len() != bin_centers.len() {
        return Err(AlignmentError::invalid(
            "histogram counts and bin centers differ in length",
        ));
    }
    if counts.is_empty() {
        return Err(AlignmentError::invalid("histogram is empty"));
    }

    let index = otsu_index(&counts, &bin_centers);
    debug!("otsu split at bin {index} of {}", counts.len());
    Ok(T::from_f64(bin_centers[index]))
}

fn otsu_index(counts: &[f64], bin_centers: &[f64]) -> usize {
    let n = counts.len();
    if n == 1 {
        return 0;
    }

    let weighted: Vec<f64> = counts
        .iter()
        .zip(bin_centers)
        .map(|(c, b)| c * b)
        .collect();

    // Class 1 holds bins 0..=i, class 2 holds bins i..n.
    let mut weight1 = vec![0.0; n];
    let mut mean1 = vec![0.0; n];
    let (mut w, mut s) = (0.0, 0.0);
    for i in 0..n {
        w += counts[i];
        s += weighted[i];
        weight1[i] = w;
        mean1[i] = s / w;
    }

    let mut weight2 = vec![0.0; n];
    let mut mean2 = vec![0.0; n];
    let (mut w, mut s) = (0.0, 0.0);
    for i in (0..n).rev() {
        w += counts[i];
        s += weighted[i];
        weight2[i] = w;
        mean2[i] = s / w;
    }

    let mut best = 0;
    let mut best_variance = f64::NEG_INFINITY;
    for i in 0..n - 1 {
        let variance = weight1[i] * weight2[i + 1] * (mean1[i] - mean2[i + 1]).powi(2);
        // Empty classes give NaN and never win; ties keep the first index.
        if variance > best_variance {
            best_variance = variance;
            best = i;
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::image::types::image_from_rows;

    #[test]
    fn test_integer_histogram_counts_each_value() {
        let image = image_from_rows(&[vec![0u8, 0, 1], vec![1, 1, 2]]).unwrap();
        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Image).unwrap();

        assert_eq!(hist.counts, vec![2, 3, 1]);
        assert_eq!(hist.bin_centers, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_integer_histogram_negative_values() {
        let image = image_from_rows(&[vec![-3i16, -3, 0, 2]]).unwrap();
        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Image).unwrap();

        assert_eq!(hist.bin_centers, vec![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(hist.counts, vec![2, 0, 0, 1, 0, 1]);
    }

    #[test]
    fn test_integer_histogram_dtype_range() {
        let image = image_from_rows(&[vec![10u8, 200]]).unwrap();
        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Dtype).unwrap();

        assert_eq!(hist.len(), 256);
        assert_eq!(hist.counts[10], 1);
        assert_eq!(hist.counts[200], 1);
        assert_eq!(hist.total(), 2);
    }

    #[test]
    fn test_wide_dtype_range_is_binned() {
        let image = image_from_rows(&[vec![1i32, 2]]).unwrap();
        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Dtype).unwrap();

        assert_eq!(hist.len(), DEFAULT_NUM_BINS);
        assert_eq!(hist.total(), 2);
        assert!(hist.bin_centers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_otsu_wide_integer_range() {
        let image = Image::<u32>::from_fn(8, 8, |x, _| Luma([if x < 4 { 0 } else { 20_000_000 }]));
        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Image).unwrap();
        assert_eq!(hist.len(), DEFAULT_NUM_BINS);
        assert_eq!(hist.counts[0], 32);
        assert_eq!(hist.counts[DEFAULT_NUM_BINS - 1], 32);

        let threshold = threshold_otsu(Some(&image), None).unwrap();
        assert!((1..20_000_000).contains(&threshold), "threshold {threshold}");

        let image = Image::<i32>::from_fn(8, 8, |_, y| Luma([if y < 4 { -15_000_000 } else { 15_000_000 }]));
        let threshold = threshold_otsu(Some(&image), None).unwrap();
        assert!((-15_000_000..15_000_000).contains(&threshold), "threshold {threshold}");
    }

    #[test]
    fn test_float_histogram_uniform_bins() {
        let image = image_from_rows(&[vec![0.0f64, 0.25, 0.5, 1.0]]).unwrap();
        let hist = histogram(&image, 2, SourceRange::Image).unwrap();

        assert_eq!(hist.counts, vec![2, 2]);
        assert_eq!(hist.bin_centers, vec![0.25, 0.75]);
    }

    #[test]
    fn test_float_histogram_dtype_range_skips_outliers() {
        let image = image_from_rows(&[vec![-0.5f32, 0.5, 3.0]]).unwrap();
        let hist = histogram(&image, 4, SourceRange::Dtype).unwrap();

        assert_eq!(hist.total(), 2);
        assert_eq!(hist.bin_centers, vec![-0.75, -0.25, 0.25, 0.75]);
    }

    #[test]
    fn test_histogram_properties_hold_for_noise() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let image = Image::<u16>::from_fn(40, 30, |_, _| Luma([rng.gen_range(100..900)]));
        let float_image = Image::<f32>::from_fn(40, 30, |x, y| Luma([(x * y) as f32 * 0.1]));

        let hist = histogram(&image, DEFAULT_NUM_BINS, SourceRange::Image).unwrap();
        assert_eq!(hist.total(), 1200);
        assert!(hist.bin_centers.windows(2).all(|w| w[0] < w[1]));

        let hist = histogram(&float_image, 64, SourceRange::Image).unwrap();
        assert_eq!(hist.total(), 1200);
        assert!(hist.bin_centers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_source_range_parse() {
        assert_eq!("image".parse::<SourceRange>().unwrap(), SourceRange::Image);
        assert_eq!("dtype".parse::<SourceRange>().unwrap(), SourceRange::Dtype);
        assert!(matches!(
            "bogus".parse::<SourceRange>(),
            Err(AlignmentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_otsu_single_value_image() {
        let image = Image::<u16>::from_pixel(8, 8, Luma([421]));
        assert_eq!(threshold_otsu(Some(&image), None).unwrap(), 421);

        let image = Image::<f32>::from_pixel(3, 3, Luma([0.125]));
        assert_eq!(threshold_otsu(Some(&image), None).unwrap(), 0.125);
    }

    #[test]
    fn test_otsu_small_integer_image() {
        let image = image_from_rows(&[vec![0u8, 0, 1, 1, 1, 2]]).unwrap();
        // weight1[0]*weight2[1]*(mean1[0]-mean2[1])^2 = 12.5 beats 9.8 at bin 1
        assert_eq!(threshold_otsu(Some(&image), None).unwrap(), 0);
    }

    #[test]
    fn test_otsu_bimodal_image() {
        let image = Image::<u16>::from_fn(20, 20, |x, _| {
            if x < 10 {
                Luma([100 + (x % 3) as u16])
            } else {
                Luma([900 + (x % 3) as u16])
            }
        });
        let threshold = threshold_otsu(Some(&image), None).unwrap();
        assert!((102..900).contains(&threshold), "threshold {threshold}");
    }

    #[test]
    fn test_otsu_from_histogram_only() {
        let hist = Histogram {
            counts: vec![5, 0, 0, 5],
            bin_centers: vec![10.0, 20.0, 30.0, 40.0],
        };
        let threshold = threshold_otsu::<f64>(None, Some(hist.into())).unwrap();
        assert_eq!(threshold, 10.0);

        let counts = HistogramInput::Counts(vec![0.0, 4.0, 0.0, 0.0, 4.0]);
        assert_eq!(threshold_otsu::<f64>(None, Some(counts)).unwrap(), 1.0);
    }

    #[test]
    fn test_otsu_requires_input() {
        assert!(matches!(
            threshold_otsu::<u8>(None, None),
            Err(AlignmentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_otsu_is_deterministic() {
        let image = Image::<f32>::from_fn(16, 16, |x, y| Luma([((x * 7 + y * 3) % 11) as f32]));
        let first = threshold_otsu(Some(&image), None).unwrap();
        let second = threshold_otsu(Some(&image), None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_threshold_mean() {
        let image = image_from_rows(&[vec![1u8, 2, 3, 6]]).unwrap();
        assert_eq!(threshold_mean(&image).unwrap(), 3.0);
    }
}
