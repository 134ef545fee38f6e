//! Temperature + min-p token sampling.

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    pub temperature: f64,
    /// Candidates below `min_p * p_max` are discarded before the draw.
    pub min_p: f64,
}

impl SamplerParams {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(ServiceError::Configuration(format!(
                "temperature must be a finite value > 0, got {}",
                self.temperature
            )));
        }
        if !self.min_p.is_finite() || self.min_p < 0.0 {
            return Err(ServiceError::Configuration(format!(
                "min_p must be a finite value >= 0, got {}",
                self.min_p
            )));
        }
        Ok(())
    }
}

pub struct Sampler {
    params: SamplerParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplerParams, seed: u64) -> Result<Self, ServiceError> {
        params.validate()?;
        Ok(Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn params(&self) -> SamplerParams {
        self.params
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<u32, ServiceError> {
        let argmax = argmax(logits)?;
        if self.params.min_p >= 1.0 {
            return Ok(argmax as u32);
        }

        let max_scaled = f64::from(logits[argmax]) / self.params.temperature;
        let weights: Vec<f64> = logits
            .iter()
            .map(|&logit| (f64::from(logit) / self.params.temperature - max_scaled).exp())
            .collect();

        // Weights are unnormalised with the argmax at exp(0) = 1, so
        // p_i >= min_p * p_max reduces to weight_i >= min_p.
        let survivors: Vec<(usize, f64)> = weights
            .iter()
            .enumerate()
            .filter(|&(index, &weight)| {
                index == argmax || (weight > 0.0 && weight >= self.params.min_p)
            })
            .map(|(index, &weight)| (index, weight))
            .collect();

        if let [(only, _)] = survivors.as_slice() {
            return Ok(*only as u32);
        }

        let mass: f64 = survivors.iter().map(|(_, weight)| weight).sum();
        let draw = self.rng.r#gen::<f64>() * mass;
        let mut cumulative = 0.0;
        for &(index, weight) in &survivors {
            cumulative += weight;
            if draw < cumulative {
                return Ok(index as u32);
            }
        }
        Ok(survivors.last().map_or(argmax, |&(index, _)| index) as u32)
    }
}

/// First index holding the largest logit.
pub fn argmax(logits: &[f32]) -> Result<usize, ServiceError> {
    if logits.is_empty() {
        return Err(ServiceError::Execution("model returned empty logits".into()));
    }
    if logits.iter().any(|v| v.is_nan() || *v == f32::INFINITY) {
        return Err(ServiceError::Execution("model returned NaN or +inf logits".into()));
    }

    let mut best = 0;
    for (index, &value) in logits.iter().enumerate().skip(1) {
        if value > logits[best] {
            best = index;
        }
    }
    if logits[best] == f32::NEG_INFINITY {
        return Err(ServiceError::Execution("every logit is -inf".into()));
    }
    Ok(best)
}
