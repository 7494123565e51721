//! # Control law
//!
//! DM command integration, contrast reduction schedule and the interface
//! shared by the control loops.

use crate::{
    devices::DeviceContext, history::History, optics::ActuatorLayout, Error, Result,
};
use nalgebra::DVector;
use std::fmt;

/// Target contrast reduction factor of each iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GammaSchedule {
    /// Same factor for every iteration
    Static(f64),
    /// Gentle first iterations converging to the factor:
    /// 0.5 for the first 10 iterations, then halfway between 0.5 and the factor
    /// for the next 10 and the factor afterwards
    AutoAdjust(f64),
}
impl GammaSchedule {
    pub fn new(gamma: f64, auto_adjust: bool) -> Self {
        if auto_adjust {
            GammaSchedule::AutoAdjust(gamma)
        } else {
            GammaSchedule::Static(gamma)
        }
    }
    /// Contrast reduction factor at iteration `i`
    pub fn gamma(&self, i: usize) -> f64 {
        match *self {
            GammaSchedule::Static(gamma) => gamma,
            GammaSchedule::AutoAdjust(_) if i < 10 => 0.5,
            GammaSchedule::AutoAdjust(gamma) if i < 20 => (0.5 + gamma) / 2f64,
            GammaSchedule::AutoAdjust(gamma) => gamma,
        }
    }
    /// Disables the schedule, the loop keeps the final factor
    pub fn disable(&mut self) {
        if let GammaSchedule::AutoAdjust(gamma) = *self {
            *self = GammaSchedule::Static(gamma);
        }
    }
}

/// Peak-to-valley of a DM correction
pub fn peak_to_valley(correction: &DVector<f64>) -> f64 {
    if correction.is_empty() {
        return 0f64;
    }
    if correction.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    let (min, max) = correction
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &x| {
            (min.min(x), max.max(x))
        });
    max - min
}

/// Refuses corrections whose peak-to-valley [nm] exceeds `ceiling` [nm]
pub fn sanity_check(correction: &DVector<f64>, ceiling: f64) -> Result<()> {
    let ptv = peak_to_valley(correction);
    if ptv > ceiling || ptv.is_nan() {
        log::error!(
            "Requested a DM correction of {:.1}nm PTV, above the {:.1}nm limit",
            ptv,
            ceiling
        );
        return Err(Error::ImplausibleCorrection { ptv, ceiling });
    }
    Ok(())
}

/// DM1 and DM2 commands [nm]
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorState {
    pub dm1: DVector<f64>,
    pub dm2: DVector<f64>,
}
impl ActuatorState {
    /// Flat DMs
    pub fn flat(layout: &ActuatorLayout) -> Self {
        Self {
            dm1: DVector::zeros(layout.len()),
            dm2: DVector::zeros(layout.len()),
        }
    }
    pub fn new(dm1: DVector<f64>, dm2: DVector<f64>) -> Self {
        Self { dm1, dm2 }
    }
    /// Subtracts the `correction` from the commands
    ///
    /// The correction is split into DM1 and DM2 according to the `layout`.
    pub fn apply_correction(
        &mut self,
        correction: &DVector<f64>,
        layout: &ActuatorLayout,
    ) -> Result<()> {
        let (dm1, dm2) = layout.split_command_vector(correction)?;
        for (command, delta) in [(&mut self.dm1, dm1), (&mut self.dm2, dm2)] {
            if command.len() != delta.len() {
                return Err(Error::dimension("DM command", command.len(), delta.len()));
            }
            *command -= delta;
        }
        Ok(())
    }
}

/// Control loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Inputs loaded, nothing measured yet
    Initializing,
    /// Taking the images the first iteration starts from
    TakingReferenceImages,
    /// Ready for the given iteration
    Iterating(usize),
    /// All iterations done
    Finished,
}
impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "initializing"),
            Phase::TakingReferenceImages => write!(f, "taking reference images"),
            Phase::Iterating(i) => write!(f, "iteration #{i}"),
            Phase::Finished => write!(f, "finished"),
        }
    }
}

/// Steps of an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Estimating,
    Solving,
    Applying,
    Imaging,
    Recording,
}
impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Estimating => write!(f, "estimating the electric field"),
            Step::Solving => write!(f, "solving for the DM correction"),
            Step::Applying => write!(f, "applying the DM correction"),
            Step::Imaging => write!(f, "imaging"),
            Step::Recording => write!(f, "recording"),
        }
    }
}

/// Closed-loop dark zone control
pub trait WavefrontControl {
    /// Takes the reference images before the first iteration
    fn take_reference_images(&mut self, devices: &mut DeviceContext) -> Result<()>;
    /// Runs one iteration of estimation, correction and imaging
    fn iterate(&mut self, devices: &mut DeviceContext) -> Result<()>;
    fn phase(&self) -> Phase;
    fn history(&self) -> &History;
    /// Runs all the iterations
    fn run(&mut self, devices: &mut DeviceContext) -> Result<()> {
        if self.phase() == Phase::Initializing {
            self.take_reference_images(devices)?;
        }
        while let Phase::Iterating(_) = self.phase() {
            self.iterate(devices)?;
        }
        Ok(())
    }
}
