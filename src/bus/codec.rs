//! Wire formats for image payloads.
//!
//! Canonical: `u32` little-endian header length, a JSON [`FrameHeader`], then
//! the raw little-endian pixels in row-major order.
//!
//! Legacy: `"<tag> <fields...>: [[row], [row], ...]"` with the pixel rows as
//! JSON. Acquisition software pads every row with a fixed number of leading
//! columns that are dropped on decode.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::image::{
    image_from_rows, types::with_frame_image, Dtype, FrameImage, Image, Intensity,
};

use super::BusError;

pub const LEGACY_COLUMN_OFFSET: usize = 32;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum FrameEncoding {
    Canonical,
    Legacy { column_offset: usize },
    /// Canonical when the payload starts with a valid header, legacy otherwise.
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FrameHeader {
    pub dtype: Dtype,
    /// (height, width)
    pub shape: [usize; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    pub image: FrameImage,
    pub timestamp: Option<DateTime<Utc>>,
    pub epoch: Option<u64>,
    pub tag: Option<String>,
}

pub fn encode_frame(
    image: &FrameImage,
    timestamp: Option<DateTime<Utc>>,
    epoch: Option<u64>,
) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let header = FrameHeader {
        dtype: image.dtype(),
        shape: [height as usize, width as usize],
        timestamp,
        epoch,
    };
    // Serializing a plain struct of numbers and strings cannot fail.
    let header = serde_json::to_vec(&header).unwrap_or_default();

    let pixel_bytes = image.dtype().byte_size() * (width * height) as usize;
    let mut payload = Vec::with_capacity(4 + header.len() + pixel_bytes);
    payload.extend_from_slice(&(header.len() as u32).to_le_bytes());
    payload.extend_from_slice(&header);
    with_frame_image!(image, img => {
        for p in img.iter() {
            payload.extend_from_slice(&p.to_le_bytes());
        }
    });
    payload
}

pub fn decode_frame(payload: &[u8], encoding: FrameEncoding) -> Result<DecodedFrame, BusError> {
    match encoding {
        FrameEncoding::Canonical => decode_canonical(payload),
        FrameEncoding::Legacy { column_offset } => decode_legacy(payload, column_offset),
        FrameEncoding::Auto => {
            if looks_canonical(payload) {
                decode_canonical(payload)
            } else {
                decode_legacy(payload, LEGACY_COLUMN_OFFSET)
            }
        }
    }
}

fn looks_canonical(payload: &[u8]) -> bool {
    match split_header(payload) {
        Some((header, _)) => header.first() == Some(&b'{'),
        None => false,
    }
}

fn split_header(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    let len_bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let header = payload.get(4..4 + len)?;
    Some((header, &payload[4 + len..]))
}

fn decode_canonical(payload: &[u8]) -> Result<DecodedFrame, BusError> {
    let (header, pixels) =
        split_header(payload).ok_or_else(|| BusError::Decode("truncated frame header".into()))?;
    let header: FrameHeader =
        serde_json::from_slice(header).map_err(|e| BusError::Decode(e.to_string()))?;

    let [height, width] = header.shape;
    if height == 0 || width == 0 {
        return Err(BusError::Decode(format!("empty frame shape {:?}", header.shape)));
    }
    let (Ok(h), Ok(w)) = (u32::try_from(height), u32::try_from(width)) else {
        return Err(BusError::Decode(format!("frame shape {:?} is too large", header.shape)));
    };
    let expected = height
        .checked_mul(width)
        .and_then(|n| n.checked_mul(header.dtype.byte_size()))
        .ok_or_else(|| BusError::Decode(format!("frame shape {:?} is too large", header.shape)))?;
    if pixels.len() != expected {
        return Err(BusError::Decode(format!(
            "expected {expected} pixel bytes for {:?} {}, got {}",
            header.shape,
            header.dtype,
            pixels.len()
        )));
    }

    let image = match header.dtype {
        Dtype::Uint8 => FrameImage::U8(raw_image(w, h, pixels, u8::from_le_bytes)?),
        Dtype::Uint16 => FrameImage::U16(raw_image(w, h, pixels, u16::from_le_bytes)?),
        Dtype::Uint32 => FrameImage::U32(raw_image(w, h, pixels, u32::from_le_bytes)?),
        Dtype::Int16 => FrameImage::I16(raw_image(w, h, pixels, i16::from_le_bytes)?),
        Dtype::Int32 => FrameImage::I32(raw_image(w, h, pixels, i32::from_le_bytes)?),
        Dtype::Float32 => FrameImage::F32(raw_image(w, h, pixels, f32::from_le_bytes)?),
        Dtype::Float64 => FrameImage::F64(raw_image(w, h, pixels, f64::from_le_bytes)?),
    };

    Ok(DecodedFrame {
        image,
        timestamp: header.timestamp,
        epoch: header.epoch,
        tag: None,
    })
}

fn raw_image<T, const N: usize>(
    width: u32,
    height: u32,
    bytes: &[u8],
    from_le: fn([u8; N]) -> T,
) -> Result<Image<T>, BusError>
where
    T: Intensity,
{
    let data = bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            from_le(buf)
        })
        .collect();
    Image::from_raw(width, height, data)
        .ok_or_else(|| BusError::Decode("pixel count does not match shape".into()))
}

fn legacy_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<tag>\S+)(?:\s+(?P<rest>.*))?$").expect("valid regex"))
}

fn decode_legacy(payload: &[u8], column_offset: usize) -> Result<DecodedFrame, BusError> {
    let text = std::str::from_utf8(payload).map_err(|e| BusError::Decode(e.to_string()))?;
    let (header, body) = text
        .split_once(": ")
        .ok_or_else(|| BusError::Decode("legacy frame is missing the ': ' separator".into()))?;

    let tag = legacy_header_regex()
        .captures(header.trim())
        .and_then(|c| c.name("tag"))
        .map(|m| m.as_str().to_string());

    let rows: Vec<Vec<f64>> =
        serde_json::from_str(body.trim()).map_err(|e| BusError::Decode(e.to_string()))?;
    let rows: Vec<Vec<f64>> = rows
        .into_iter()
        .map(|row| row.into_iter().skip(column_offset).collect())
        .collect();

    let integral = rows.iter().flatten().all(|v| {
        v.fract() == 0.0 && *v >= i32::MIN as f64 && *v <= i32::MAX as f64
    });

    let image = if integral {
        let rows: Vec<Vec<i32>> = rows
            .iter()
            .map(|row| row.iter().map(|&v| v as i32).collect())
            .collect();
        image_from_rows(&rows).map(FrameImage::I32)
    } else {
        image_from_rows(&rows).map(FrameImage::F64)
    };
    let image = image.map_err(|e| BusError::Decode(e.to_string()))?;

    Ok(DecodedFrame {
        image,
        timestamp: None,
        epoch: None,
        tag,
    })
}
