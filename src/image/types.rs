use std::fmt;

use image::{ImageBuffer, Luma, Primitive};
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::error::{AlignmentError, Result};

pub type Image<T> = ImageBuffer<Luma<T>, Vec<T>>;

pub type Mask = ImageBuffer<Luma<u8>, Vec<u8>>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Uint8,
    Uint16,
    Uint32,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl Dtype {
    pub fn is_integer(&self) -> bool {
        !matches!(self, Dtype::Float32 | Dtype::Float64)
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Dtype::Uint8 => 1,
            Dtype::Uint16 | Dtype::Int16 => 2,
            Dtype::Uint32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    /// Canonical intensity limits of the type. Floating images are assumed to be
    /// normalized to [-1, 1].
    pub fn limits(&self) -> (f64, f64) {
        match self {
            Dtype::Uint8 => (u8::MIN as f64, u8::MAX as f64),
            Dtype::Uint16 => (u16::MIN as f64, u16::MAX as f64),
            Dtype::Uint32 => (u32::MIN as f64, u32::MAX as f64),
            Dtype::Int16 => (i16::MIN as f64, i16::MAX as f64),
            Dtype::Int32 => (i32::MIN as f64, i32::MAX as f64),
            Dtype::Float32 | Dtype::Float64 => (-1.0, 1.0),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        };
        write!(f, "{name}")
    }
}

pub trait Intensity: Primitive + Send + Sync + fmt::Debug + 'static {
    const DTYPE: Dtype;

    fn as_f64(self) -> f64 {
        ToPrimitive::to_f64(&self).unwrap_or(f64::NAN)
    }

    /// Converts back into the pixel type, saturating at the type bounds.
    fn from_f64(value: f64) -> Self {
        let (lo, hi) = (
            Self::min_value().as_f64(),
            Self::max_value().as_f64(),
        );
        let clamped = if Self::DTYPE.is_integer() {
            value.clamp(lo, hi)
        } else {
            value
        };
        <Self as NumCast>::from(clamped).unwrap_or_else(Self::zero)
    }
}

macro_rules! impl_intensity {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Intensity for $ty {
                const DTYPE: Dtype = $dtype;
            }
        )*
    };
}

impl_intensity! {
    u8 => Dtype::Uint8,
    u16 => Dtype::Uint16,
    u32 => Dtype::Uint32,
    i16 => Dtype::Int16,
    i32 => Dtype::Int32,
    f32 => Dtype::Float32,
    f64 => Dtype::Float64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameImage {
    U8(Image<u8>),
    U16(Image<u16>),
    U32(Image<u32>),
    I16(Image<i16>),
    I32(Image<i32>),
    F32(Image<f32>),
    F64(Image<f64>),
}

macro_rules! with_frame_image {
    ($frame:expr, $img:ident => $body:expr) => {
        match $frame {
            FrameImage::U8($img) => $body,
            FrameImage::U16($img) => $body,
            FrameImage::U32($img) => $body,
            FrameImage::I16($img) => $body,
            FrameImage::I32($img) => $body,
            FrameImage::F32($img) => $body,
            FrameImage::F64($img) => $body,
        }
    };
}

pub(crate) use with_frame_image;

impl FrameImage {
    pub fn dtype(&self) -> Dtype {
        match self {
            FrameImage::U8(_) => Dtype::Uint8,
            FrameImage::U16(_) => Dtype::Uint16,
            FrameImage::U32(_) => Dtype::Uint32,
            FrameImage::I16(_) => Dtype::Int16,
            FrameImage::I32(_) => Dtype::Int32,
            FrameImage::F32(_) => Dtype::Float32,
            FrameImage::F64(_) => Dtype::Float64,
        }
    }

    /// (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        with_frame_image!(self, img => img.dimensions())
    }

    pub fn to_f32(&self) -> Image<f32> {
        with_frame_image!(self, img => convert(img))
    }
}

macro_rules! impl_from_image {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Image<$ty>> for FrameImage {
                fn from(image: Image<$ty>) -> Self {
                    FrameImage::$variant(image)
                }
            }
        )*
    };
}

impl_from_image! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    i16 => I16,
    i32 => I32,
    f32 => F32,
    f64 => F64,
}

pub fn convert<S: Intensity, D: Intensity>(image: &Image<S>) -> Image<D> {
    let (width, height) = image.dimensions();
    let data = image.iter().map(|&p| D::from_f64(p.as_f64())).collect();
    // Same dimensions and pixel count as the source, so from_raw cannot fail.
    Image::from_raw(width, height, data).unwrap_or_else(|| Image::new(width, height))
}

pub fn image_from_rows<T: Intensity>(rows: &[Vec<T>]) -> Result<Image<T>> {
    let height = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if height == 0 || width == 0 {
        return Err(AlignmentError::invalid("image must be non-empty"));
    }
    if rows.iter().any(|row| row.len() != width) {
        return Err(AlignmentError::invalid("image rows must have equal length"));
    }

    let data: Vec<T> = rows.iter().flatten().copied().collect();
    Image::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| AlignmentError::invalid("pixel count does not match shape"))
}

pub fn ensure_non_empty<T: Intensity>(image: &Image<T>) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(AlignmentError::invalid("image must be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f64_saturates_integers() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(i16::from_f64(-12.0), -12);
        assert_eq!(f32::from_f64(0.25), 0.25);
    }

    #[test]
    fn test_image_from_rows_rejects_ragged() {
        let rows = vec![vec![1u16, 2, 3], vec![4, 5]];
        assert!(matches!(
            image_from_rows(&rows),
            Err(AlignmentError::InvalidArgument(_))
        ));
        assert!(image_from_rows::<u16>(&[]).is_err());
    }

    #[test]
    fn test_frame_image_to_f32() {
        let image = image_from_rows(&[vec![1u16, 2], vec![3, 400]]).unwrap();
        let frame = FrameImage::from(image);

        assert_eq!(frame.dtype(), Dtype::Uint16);
        assert_eq!(frame.dimensions(), (2, 2));
        assert_eq!(frame.to_f32().into_raw(), vec![1.0, 2.0, 3.0, 400.0]);
    }

    #[test]
    fn test_dtype_display_matches_serde() {
        for dtype in [Dtype::Uint8, Dtype::Int16, Dtype::Float64] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{dtype}\""));
        }
    }
}
