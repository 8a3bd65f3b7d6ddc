use crate::{
    error::{AlignmentError, Result},
    image::Mask,
};

pub const FOREGROUND: u8 = 1;

/// Two masks without any foreground score 1.0.
pub fn similarity(predicted: &Mask, truth: &Mask) -> Result<f64> {
    similarity_with_label(predicted, truth, FOREGROUND)
}

pub fn similarity_with_label(predicted: &Mask, truth: &Mask, label: u8) -> Result<f64> {
    if predicted.dimensions() != truth.dimensions() {
        return Err(AlignmentError::invalid(format!(
            "mask shapes differ: {:?} vs {:?}",
            predicted.dimensions(),
            truth.dimensions()
        )));
    }

    let (mut intersection, mut predicted_count, mut truth_count) = (0u64, 0u64, 0u64);
    for (&p, &t) in predicted.iter().zip(truth.iter()) {
        let (p, t) = (p == label, t == label);
        predicted_count += p as u64;
        truth_count += t as u64;
        intersection += (p && t) as u64;
    }

    let total = predicted_count + truth_count;
    if total == 0 {
        return Ok(1.0);
    }
    Ok(2.0 * intersection as f64 / total as f64)
}
