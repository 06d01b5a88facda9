use serde::Serialize;

/// Two-sided 95% normal quantile.
const Z95: f64 = 1.96;

/// Sample moments of one metric within one condition group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Moments {
    pub n: usize,
    pub mean: f64,
    pub std: f64,
    pub ci95: f64,
}

impl Moments {
    /// `None` for an empty sample; std and ci95 are 0 below two samples.
    pub fn of(values: &[f64]) -> Option<Self> {
        let mean = mean(values)?;
        let std = sample_std(values);
        Some(Self {
            n: values.len(),
            mean,
            std,
            ci95: ci95(values),
        })
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Bessel-corrected standard deviation.
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    let Some(mu) = mean(values) else {
        return 0.0;
    };
    if n < 2 {
        return 0.0;
    }
    let ss: f64 = values.iter().map(|v| (v - mu) * (v - mu)).sum();
    (ss / (n - 1) as f64).sqrt()
}

pub fn ci95(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    Z95 * sample_std(values) / (values.len() as f64).sqrt()
}
