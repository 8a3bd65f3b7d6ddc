use std::{fmt, str::FromStr};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{AlignmentError, Result},
    image::{binarize, threshold_mean, threshold_otsu, Image, Intensity, Mask},
};

use super::similarity::similarity;

pub const STACK_SIZE: usize = 5;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BinarizeMethod {
    Mean,
    #[default]
    Otsu,
}

impl BinarizeMethod {
    pub fn threshold<T: Intensity>(&self, image: &Image<T>) -> Result<f64> {
        match self {
            BinarizeMethod::Mean => threshold_mean(image),
            BinarizeMethod::Otsu => threshold_otsu(Some(image), None).map(Intensity::as_f64),
        }
    }

    pub fn binarize<T: Intensity>(&self, image: &Image<T>) -> Result<Mask> {
        let threshold = self.threshold(image)?;
        Ok(binarize(image, threshold))
    }
}

impl FromStr for BinarizeMethod {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(BinarizeMethod::Mean),
            "otsu" => Ok(BinarizeMethod::Otsu),
            other => Err(AlignmentError::invalid(format!(
                "method must be one of [mean, otsu], got {other}"
            ))),
        }
    }
}

impl fmt::Display for BinarizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinarizeMethod::Mean => write!(f, "mean"),
            BinarizeMethod::Otsu => write!(f, "otsu"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MatchResult {
    pub index: usize,
    pub scores: Vec<f64>,
}

impl MatchResult {
    pub fn best_score(&self) -> f64 {
        self.scores[self.index]
    }

    pub fn displacement(&self, step: f64) -> Result<f64> {
        displacement_for(self.index, step)
    }
}

pub fn displacement_for(index: usize, step: f64) -> Result<f64> {
    if index >= STACK_SIZE {
        return Err(AlignmentError::invalid(format!(
            "match index {index} outside a {STACK_SIZE}-plane stack"
        )));
    }
    Ok((index as f64 - (STACK_SIZE / 2) as f64) * step)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlignmentEngine {
    method: BinarizeMethod,
}

impl AlignmentEngine {
    pub fn new(method: BinarizeMethod) -> Self {
        Self { method }
    }

    pub fn from_method_name(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    pub fn method(&self) -> BinarizeMethod {
        self.method
    }

    /// Ties resolve to the lowest index. A candidate whose shape differs from the
    /// target fails the whole batch.
    pub fn select_best_match<T: Intensity>(
        &self,
        target: &Image<T>,
        candidates: &[Image<T>],
    ) -> Result<MatchResult> {
        if candidates.is_empty() {
            return Err(AlignmentError::invalid("no candidate images to match"));
        }
        if let Some((n, bad)) = candidates
            .iter()
            .enumerate()
            .find(|(_, c)| c.dimensions() != target.dimensions())
        {
            return Err(AlignmentError::invalid(format!(
                "candidate {n} has shape {:?}, target has {:?}",
                bad.dimensions(),
                target.dimensions()
            )));
        }

        let target_mask = self.method.binarize(target)?;
        let scores = candidates
            .par_iter()
            .map(|candidate| {
                let mask = self.method.binarize(candidate)?;
                similarity(&target_mask, &mask)
            })
            .collect::<Result<Vec<f64>>>()?;

        for (n, score) in scores.iter().enumerate() {
            debug!("image {n} is {score} accurate");
        }

        let index = scores
            .iter()
            .enumerate()
            .fold(0, |best, (n, &score)| if score > scores[best] { n } else { best });

        info!("best match is plane {index} with score {:.4}", scores[index]);
        Ok(MatchResult { index, scores })
    }

    pub fn score<T: Intensity>(&self, target: &Image<T>, image: &Image<T>) -> Result<f64> {
        let target_mask = self.method.binarize(target)?;
        let mask = self.method.binarize(image)?;
        similarity(&target_mask, &mask)
    }
}
