pub mod operations;
pub mod statistics;
pub mod types;

pub use operations::{binarize, invert_mask, median_frames, median_images};

pub use statistics::{
    histogram, threshold_mean, threshold_otsu, threshold_otsu_bins, Histogram, HistogramInput,
    SourceRange, DEFAULT_NUM_BINS,
};

pub use types::*;
