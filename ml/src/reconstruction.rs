//! Distances between an input patch and its reconstruction, and their statistics over
//! many patch positions.
use crate::ImagePrecision;
use bitflags::bitflags;
use ndarray::*;

bitflags! {
    /// Selection of distances computed by a reconstruction score.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScoreMask: u8 {
        const EUCLIDEAN   = 1 << 0;
        const INVARIANT   = 1 << 1;
        const CORRELATION = 1 << 2;
        const ALL = Self::EUCLIDEAN.bits() | Self::INVARIANT.bits() | Self::CORRELATION.bits();
    }
}

/// Square root of the summed squared differences.
pub fn euclidean_distance<D: Dimension>(
    original: ArrayView<ImagePrecision, D>,
    reconstruction: ArrayView<ImagePrecision, D>,
) -> ImagePrecision {
    Zip::from(&original)
        .and(&reconstruction)
        .fold(0.0, |acc, &a, &b| acc + (a - b).powi(2))
        .sqrt()
}

fn mean_and_variance<D: Dimension>(values: &ArrayView<ImagePrecision, D>) -> (ImagePrecision, ImagePrecision) {
    (values.mean().unwrap_or(0.0), values.var(0.0))
}

/// Root mean squared residual after fitting the reconstruction to the original with the
/// best scale and offset, so that global contrast and brightness changes do not count.
pub fn invariant_distance<D: Dimension>(
    original: ArrayView<ImagePrecision, D>,
    reconstruction: ArrayView<ImagePrecision, D>,
) -> ImagePrecision {
    let (mean_o, _) = mean_and_variance(&original);
    let (mean_r, var_r) = mean_and_variance(&reconstruction);
    let n = original.len().max(1) as ImagePrecision;
    let covariance = Zip::from(&original)
        .and(&reconstruction)
        .fold(0.0, |acc, &o, &r| acc + (o - mean_o) * (r - mean_r))
        / n;
    let scale = if var_r > 0.0 { covariance / var_r } else { 0.0 };
    let offset = mean_o - scale * mean_r;
    let residual = Zip::from(&original)
        .and(&reconstruction)
        .fold(0.0, |acc, &o, &r| acc + (o - scale * r - offset).powi(2));
    (residual / n).sqrt()
}

/// One minus the Pearson correlation. Constant patches count as uncorrelated.
pub fn correlation_distance<D: Dimension>(
    original: ArrayView<ImagePrecision, D>,
    reconstruction: ArrayView<ImagePrecision, D>,
) -> ImagePrecision {
    let (mean_o, var_o) = mean_and_variance(&original);
    let (mean_r, var_r) = mean_and_variance(&reconstruction);
    if var_o <= 0.0 || var_r <= 0.0 {
        return 1.0;
    }
    let n = original.len() as ImagePrecision;
    let covariance = Zip::from(&original)
        .and(&reconstruction)
        .fold(0.0, |acc, &o, &r| acc + (o - mean_o) * (r - mean_r))
        / n;
    1.0 - covariance / (var_o * var_r).sqrt()
}

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    count: usize,
    mean: f64,
    m2: f64,
}

impl Summary {
    pub fn add(&mut self, value: ImagePrecision) {
        let value = f64::from(value);
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance, 0 for fewer than two values.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

/// Statistics of the selected distances over all scored positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionScore {
    euclidean: Option<Summary>,
    invariant: Option<Summary>,
    correlation: Option<Summary>,
    positions: usize,
}

impl ReconstructionScore {
    pub fn new(mask: ScoreMask) -> ReconstructionScore {
        let pick = |flag| if mask.contains(flag) { Some(Summary::default()) } else { None };
        ReconstructionScore {
            euclidean: pick(ScoreMask::EUCLIDEAN),
            invariant: pick(ScoreMask::INVARIANT),
            correlation: pick(ScoreMask::CORRELATION),
            positions: 0,
        }
    }

    /// Adds the distances of one position. Distances not selected on construction are
    /// ignored.
    pub fn record(
        &mut self,
        euclidean: Option<ImagePrecision>,
        invariant: Option<ImagePrecision>,
        correlation: Option<ImagePrecision>,
    ) {
        for (summary, value) in [
            (&mut self.euclidean, euclidean),
            (&mut self.invariant, invariant),
            (&mut self.correlation, correlation),
        ]
        .iter_mut()
        {
            if let (Some(summary), Some(value)) = (summary.as_mut(), *value) {
                summary.add(value);
            }
        }
        self.positions += 1;
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn euclidean(&self) -> Option<&Summary> {
        self.euclidean.as_ref()
    }

    pub fn invariant(&self) -> Option<&Summary> {
        self.invariant.as_ref()
    }

    pub fn correlation(&self) -> Option<&Summary> {
        self.correlation.as_ref()
    }

    /// Means and variances of the selected distances, in the order euclidean, invariant,
    /// correlation.
    pub fn to_vec(&self) -> Vec<f64> {
        [&self.euclidean, &self.invariant, &self.correlation]
            .iter()
            .filter_map(|s| s.as_ref())
            .flat_map(|s| vec![s.mean(), s.variance()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mask_bits() {
        let mask = ScoreMask::EUCLIDEAN | ScoreMask::CORRELATION;
        assert!(mask.contains(ScoreMask::EUCLIDEAN));
        assert!(!mask.contains(ScoreMask::INVARIANT));
        assert_eq!(mask.bits(), 5);
        assert_eq!(ScoreMask::from_bits_truncate(255), ScoreMask::ALL);
        assert_eq!(ScoreMask::from_bits(8), None);
    }

    #[test]
    fn test_euclidean() {
        let a = array![0.0, 0.0];
        let b = array![3.0, 4.0];
        assert_eq!(euclidean_distance(a.view(), b.view()), 5.0);
    }

    #[test]
    fn test_invariant_ignores_scale_and_offset() {
        let a = array![0.1, 0.5, 0.3, 0.9];
        let b = a.mapv(|x| 2.0 * x - 1.0);
        assert_abs_diff_eq!(invariant_distance(a.view(), b.view()), 0.0, epsilon = 1e-5);
        assert!(euclidean_distance(a.view(), b.view()) > 0.5);
    }

    #[test]
    fn test_correlation_distance() {
        let a = array![1.0, 2.0, 3.0];
        assert_abs_diff_eq!(correlation_distance(a.view(), a.view()), 0.0, epsilon = 1e-6);
        let inverted = array![3.0, 2.0, 1.0];
        assert_abs_diff_eq!(correlation_distance(a.view(), inverted.view()), 2.0, epsilon = 1e-6);
        let constant = array![1.0, 1.0, 1.0];
        assert_eq!(correlation_distance(a.view(), constant.view()), 1.0);
    }

    #[test]
    fn test_summary() {
        let mut summary = Summary::default();
        for &v in [1.0, 2.0, 3.0, 4.0].iter() {
            summary.add(v);
        }
        assert_abs_diff_eq!(summary.mean(), 2.5);
        assert_abs_diff_eq!(summary.variance(), 1.25, epsilon = 1e-12);
    }

    #[test]
    fn test_score_records_selected() {
        let mut score = ReconstructionScore::new(ScoreMask::INVARIANT);
        score.record(Some(1.0), Some(2.0), None);
        score.record(None, Some(4.0), None);
        assert_eq!(score.positions(), 2);
        assert!(score.euclidean().is_none());
        assert_eq!(score.to_vec(), vec![3.0, 1.0]);
    }
}
