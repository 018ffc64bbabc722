use crate::config::StrideConfig;
use crate::types::{StepEvent, StrideSample, UserProfile};

/// Step → metric stride length.
///
/// Anthropometric model `Δs = k · √height · cadence^0.3`, with `k` chosen so the
/// reference subject (1.75 m at 2 Hz) strides 0.75 m.
#[derive(Clone, Debug)]
pub struct StrideModel {
    config: StrideConfig,
    height_m: f64,
    k: f64,
}

impl StrideModel {
    pub fn new(config: &StrideConfig, profile: &UserProfile) -> Self {
        let k = config.reference_stride_m
            / (config.reference_height_m.sqrt()
                * config.reference_cadence_hz.powf(config.cadence_exponent));
        Self {
            config: config.clone(),
            height_m: profile.height_m,
            k,
        }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    pub fn anthropometric(&self, cadence_hz: f64) -> f64 {
        let cadence = if cadence_hz.is_finite() && cadence_hz > 0.0 {
            cadence_hz
        } else {
            self.config.reference_cadence_hz
        };
        (self.k * self.height_m.sqrt() * cadence.powf(self.config.cadence_exponent))
            .clamp(self.config.min_stride_m, self.config.max_stride_m)
    }

    /// Platform length when the event carries a usable one, else the model.
    pub fn length(&self, step: &StepEvent) -> f64 {
        let model = self.anthropometric(step.cadence_hz);
        match step.platform_length() {
            Some(len) if len.is_finite() && len > 0.0 => {
                let w = self.config.platform_weight;
                w * len + (1.0 - w) * model
            }
            Some(len) => {
                log::debug!("ignoring platform step length {}", len);
                model
            }
            None => model,
        }
    }

    pub fn sample(&self, step: StepEvent, heading: f64) -> StrideSample {
        StrideSample {
            step,
            delta_s: self.length(&step),
            heading,
        }
    }
}
