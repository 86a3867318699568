//! Population-level standardization per axis.
//!
//! Scaler parameters are fitted once on the discovery population and then
//! reused, unchanged, for every later membership computation on that axis.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::axis::Axis;
use crate::error::{SegResult, SegmentationError};
use crate::features::FeatureVector;

/// Per-feature mean and standard deviation of a population sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub axis: Axis,
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    /// Population std (ddof = 0); zero-variance features are stored as 1.0.
    pub std: Vec<f64>,
}

impl ScalerParams {
    pub fn dimension(&self) -> usize {
        self.feature_names.len()
    }

    /// Fail unless `axis` currently declares exactly these feature names.
    pub fn ensure_matches(&self, axis: Axis) -> SegResult<()> {
        let expected = axis.feature_names();
        let same = self.axis == axis
            && self.feature_names.len() == expected.len()
            && self.feature_names.iter().zip(expected).all(|(a, b)| a == b);
        if same {
            Ok(())
        } else {
            Err(SegmentationError::StaleScalerMismatch {
                axis,
                expected: self.feature_names.clone(),
                actual: expected.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    /// Standardize one customer's vector with the fitted population statistics.
    pub fn transform(&self, features: &FeatureVector) -> SegResult<Array1<f64>> {
        self.ensure_matches(features.axis())?;
        Ok(self.standardize(features.view()))
    }

    /// Standardize a whole population into an `(n, d)` matrix.
    pub fn transform_population(&self, vectors: &[FeatureVector]) -> SegResult<Array2<f64>> {
        let mut records = Array2::zeros((vectors.len(), self.dimension()));
        for (mut row, fv) in records.outer_iter_mut().zip(vectors) {
            row.assign(&self.transform(fv)?);
        }
        Ok(records)
    }

    /// Map a standardized point back to raw feature units.
    pub fn inverse_transform(&self, standardized: ArrayView1<'_, f64>) -> Array1<f64> {
        standardized
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(z, (mean, std))| z * std + mean)
            .collect()
    }

    fn standardize(&self, raw: ArrayView1<'_, f64>) -> Array1<f64> {
        raw.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(x, (mean, std))| (x - mean) / std)
            .collect()
    }
}

/// Fits [`ScalerParams`] on a population sample.
pub struct AxisScaler;

impl AxisScaler {
    /// Compute population mean and std for every feature of `axis`.
    ///
    /// # Errors
    /// `InvalidParameter` for an empty sample or vectors from another axis.
    pub fn fit(axis: Axis, population: &[FeatureVector]) -> SegResult<ScalerParams> {
        if population.is_empty() {
            return Err(SegmentationError::invalid_parameter(format!(
                "cannot fit scaler for {} on an empty population",
                axis
            )));
        }
        if let Some(other) = population.iter().find(|fv| fv.axis() != axis) {
            return Err(SegmentationError::invalid_parameter(format!(
                "population for {} contains a {} vector",
                axis,
                other.axis()
            )));
        }

        let records = raw_matrix(axis, population);
        let mean = records
            .mean_axis(ndarray::Axis(0))
            .ok_or_else(|| SegmentationError::invalid_parameter("empty population"))?;
        let std = records.std_axis(ndarray::Axis(0), 0.0);

        Ok(ScalerParams {
            axis,
            feature_names: axis.feature_names().iter().map(|s| s.to_string()).collect(),
            mean: mean.to_vec(),
            std: std
                .iter()
                .map(|s| if *s > 0.0 && s.is_finite() { *s } else { 1.0 })
                .collect(),
        })
    }
}

fn raw_matrix(axis: Axis, population: &[FeatureVector]) -> Array2<f64> {
    let mut records = Array2::zeros((population.len(), axis.dimension()));
    for (mut row, fv) in records.outer_iter_mut().zip(population) {
        row.assign(&fv.view());
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(values: [f64; 3]) -> FeatureVector {
        FeatureVector::new("c", Axis::PurchaseFrequency, values.to_vec()).unwrap()
    }

    #[test]
    fn test_fit_uses_population_statistics() {
        let population = vec![fv([1.0, 10.0, 5.0]), fv([3.0, 30.0, 5.0])];
        let params = AxisScaler::fit(Axis::PurchaseFrequency, &population).unwrap();

        assert_eq!(params.mean, vec![2.0, 20.0, 5.0]);
        assert_eq!(params.std[0], 1.0);
        assert_eq!(params.std[1], 10.0);
        // Zero variance is replaced so nothing divides by zero
        assert_eq!(params.std[2], 1.0);

        let z = params.transform(&fv([3.0, 0.0, 5.0])).unwrap();
        assert_eq!(z.to_vec(), vec![1.0, -2.0, 0.0]);
    }

    #[test]
    fn test_inverse_transform_recovers_raw_values() {
        let population = vec![fv([1.0, 10.0, 0.2]), fv([5.0, 50.0, 0.8]), fv([3.0, 20.0, 0.5])];
        let params = AxisScaler::fit(Axis::PurchaseFrequency, &population).unwrap();

        let raw = fv([4.0, 35.0, 0.6]);
        let z = params.transform(&raw).unwrap();
        let back = params.inverse_transform(z.view());
        for (a, b) in back.iter().zip(raw.values()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_transform_rejects_other_axis() {
        let population = vec![fv([1.0, 2.0, 3.0])];
        let params = AxisScaler::fit(Axis::PurchaseFrequency, &population).unwrap();

        let spending = FeatureVector::new("c", Axis::SpendingLevel, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            params.transform(&spending),
            Err(SegmentationError::StaleScalerMismatch { .. })
        ));
    }

    #[test]
    fn test_renamed_features_are_stale() {
        let population = vec![fv([1.0, 2.0, 3.0])];
        let mut params = AxisScaler::fit(Axis::PurchaseFrequency, &population).unwrap();
        params.feature_names[1] = "days_between_orders".to_string();

        let err = params.transform(&fv([1.0, 2.0, 3.0])).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_fit_rejects_empty_and_mixed_populations() {
        assert!(AxisScaler::fit(Axis::PurchaseFrequency, &[]).is_err());

        let spending = FeatureVector::new("c", Axis::SpendingLevel, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(AxisScaler::fit(Axis::PurchaseFrequency, &[fv([1.0, 2.0, 3.0]), spending]).is_err());
    }
}
