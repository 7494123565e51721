//! # Iteration history
//!
//! Per-iteration diagnostics of the control loop, pickled after every iteration.

use crate::Result;
use serde::Serialize;
use std::{fs::File, path::Path};

/// Diagnostics of one iteration
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub timestamp: String,
    /// Contrast reduction factor
    pub gamma: f64,
    /// Tikhonov parameter
    pub mu: f64,
    pub num_exposures: usize,
    /// Mean dark zone contrast of the image taken after the correction
    pub mean_contrast_image: f64,
    /// Mean dark zone contrast of the estimated electric field
    pub mean_contrast_pairwise: f64,
    /// Mean dark zone contrast of the last probe image
    pub mean_contrast_probe: f64,
    pub predicted_contrast: f64,
    pub predicted_contrast_delta: f64,
    pub measured_contrast_delta: f64,
    pub estimated_incoherent_background: f64,
    /// Electric field autoscaling factors, one per wavelength
    pub e_field_scale_factors: Vec<f64>,
    /// Correction peak-to-valley [nm]
    pub correction_ptv: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Diagnostics of a control loop run
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    /// Wavelengths [nm]
    pub wavelengths: Vec<f64>,
    initial_contrast: Option<f64>,
    records: Vec<IterationRecord>,
}
impl History {
    pub fn new(wavelengths: Vec<f64>) -> Self {
        Self {
            wavelengths,
            ..Default::default()
        }
    }
    /// Sets the mean dark zone contrast before the first iteration
    pub fn set_initial_contrast(&mut self, contrast: f64) {
        self.initial_contrast = Some(contrast);
    }
    pub fn initial_contrast(&self) -> Option<f64> {
        self.initial_contrast
    }
    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }
    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }
    pub fn last(&self) -> Option<&IterationRecord> {
        self.records.last()
    }
    /// Latest measured mean dark zone contrast
    pub fn last_contrast(&self) -> Option<f64> {
        self.records
            .last()
            .map(|record| record.mean_contrast_image)
            .or(self.initial_contrast)
    }
    /// Measured mean dark zone contrasts, the initial one first
    pub fn mean_contrasts_image(&self) -> Vec<f64> {
        self.initial_contrast
            .into_iter()
            .chain(self.records.iter().map(|record| record.mean_contrast_image))
            .collect()
    }
    /// Pickles the history
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        serde_pickle::to_writer(&mut file, self, Default::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: usize, contrast: f64) -> IterationRecord {
        IterationRecord {
            iteration,
            timestamp: String::new(),
            gamma: 0.8,
            mu: 1e-7,
            num_exposures: 10,
            mean_contrast_image: contrast,
            mean_contrast_pairwise: contrast,
            mean_contrast_probe: contrast,
            predicted_contrast: contrast,
            predicted_contrast_delta: 0.,
            measured_contrast_delta: 0.,
            estimated_incoherent_background: 0.,
            e_field_scale_factors: vec![1.],
            correction_ptv: 0.,
            temperature: None,
            humidity: None,
        }
    }

    #[test]
    fn contrasts() {
        let mut history = History::new(vec![640.]);
        assert_eq!(history.last_contrast(), None);
        history.set_initial_contrast(1e-6);
        assert_eq!(history.last_contrast(), Some(1e-6));
        history.push(record(0, 5e-7));
        history.push(record(1, 2e-7));
        assert_eq!(history.last_contrast(), Some(2e-7));
        assert_eq!(history.mean_contrasts_image(), vec![1e-6, 5e-7, 2e-7]);
    }

    #[test]
    fn pickle() {
        let path = std::env::temp_dir().join(format!("strokemin-history-{}.pkl", std::process::id()));
        let mut history = History::new(vec![640.]);
        history.set_initial_contrast(1e-6);
        history.push(record(0, 5e-7));
        history.save(&path).unwrap();
        let value =
            serde_pickle::value_from_reader(std::fs::File::open(&path).unwrap(), Default::default())
                .unwrap();
        assert!(format!("{value:?}").contains("mean_contrast_image"));
    }
}
