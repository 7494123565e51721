//! # Stroke minimization
//!
//! The DM correction is the regularized least-squares solution
//! `x = (A + μI)⁻¹ B` of the quadratic model of the dark zone contrast
//!
//! `C(x) = xᵀAx - 2Bᵀx + c`
//!
//! with `A = MMᵀ`, `B = Mb`, `c = bᵀb`, `M` the dark zone Jacobian and `b`
//! the stacked real and imaginary parts of the dark zone field, all normalized
//! by the number of dark zone pixels. The Tikhonov parameter `μ` is searched
//! for the smallest DM stroke whose predicted contrast reaches `γc`.

use crate::{
    optics::{ByWavelength, DarkZone, Jacobian},
    Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector, SymmetricEigen};

/// Lowest Tikhonov parameter
pub const MU_MIN: f64 = 1e-16;
/// Largest Tikhonov parameter
pub const MU_MAX: f64 = 1e16;
const MAX_BRACKETING_STEPS: usize = 200;
const MAX_REFINEMENTS: usize = 60;
const TARGET_TOLERANCE: f64 = 1e-3;

/// Stroke minimization result
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeMinSolution {
    /// DM correction [nm], to be subtracted from the DM commands
    pub correction: DVector<f64>,
    /// Tikhonov parameter of the correction
    pub mu: f64,
    /// Dark zone contrast before correction
    pub contrast: f64,
    /// Predicted dark zone contrast after correction
    pub predicted_contrast: f64,
    /// `predicted_contrast - contrast`
    pub predicted_contrast_delta: f64,
    /// Whether the predicted contrast reached the target
    pub converged: bool,
}
impl StrokeMinSolution {
    /// Scales the correction by the control `gain`
    ///
    /// The predicted contrast change is assumed linear with the gain.
    pub fn scaled(self, gain: f64) -> Self {
        let delta = gain * self.predicted_contrast_delta;
        Self {
            correction: self.correction * gain,
            predicted_contrast: self.contrast + delta,
            predicted_contrast_delta: delta,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
struct Trial {
    mu: f64,
    correction: DVector<f64>,
    predicted: f64,
}

/// Quadratic model of the dark zone contrast
#[derive(Debug, Clone)]
pub struct StrokeMinProblem {
    a: DMatrix<f64>,
    b: DVector<f64>,
    c: f64,
    eigen: SymmetricEigen<f64, nalgebra::Dynamic>,
}
impl StrokeMinProblem {
    /// Builds the model from the dark zone Jacobian `m`, (actuators)x(2 pixels),
    /// and the dark zone electric `field`
    pub fn new(m: &DMatrix<f64>, field: &DVector<Complex<f64>>) -> Result<Self> {
        Self::weighted([(1f64, m, field)])
    }
    /// Builds the model from weighted (weight,Jacobian,field) terms
    ///
    /// Terms with a zero weight are skipped.
    pub fn weighted<'a, I>(terms: I) -> Result<Self>
    where
        I: IntoIterator<Item = (f64, &'a DMatrix<f64>, &'a DVector<Complex<f64>>)>,
    {
        let mut sums: Option<(DMatrix<f64>, DVector<f64>, f64)> = None;
        let mut n_pixel = 0;
        for (weight, m, field) in terms {
            if weight == 0f64 {
                continue;
            }
            if m.ncols() != 2 * field.len() {
                return Err(Error::dimension(
                    "dark zone Jacobian columns",
                    2 * field.len(),
                    m.ncols(),
                ));
            }
            n_pixel = field.len();
            let b = DVector::from_iterator(
                m.ncols(),
                field.iter().map(|e| e.re).chain(field.iter().map(|e| e.im)),
            );
            let a_n = m * m.transpose() * weight;
            let b_n = m * &b * weight;
            let c_n = b.dot(&b) * weight;
            sums = Some(match sums {
                None => (a_n, b_n, c_n),
                Some((a, b, c)) => {
                    if a.shape() != a_n.shape() {
                        return Err(Error::dimension(
                            "dark zone Jacobian rows",
                            a.nrows(),
                            a_n.nrows(),
                        ));
                    }
                    (a + a_n, b + b_n, c + c_n)
                }
            });
        }
        let (a, b, c) = sums.ok_or(Error::NoChannel)?;
        let n = n_pixel.max(1) as f64;
        let (a, b, c) = (a / n, b / n, c / n);
        let eigen = SymmetricEigen::new(a.clone());
        Ok(Self { a, b, c, eigen })
    }
    /// Dark zone contrast without correction
    pub fn contrast(&self) -> f64 {
        self.c
    }
    /// Number of actuators
    pub fn n_actuator(&self) -> usize {
        self.b.len()
    }
    /// Correction `(A + μI)⁻¹ B`
    pub fn solve(&self, mu: f64) -> DVector<f64> {
        let v = &self.eigen.eigenvectors;
        let mut beta = v.tr_mul(&self.b);
        beta.iter_mut()
            .zip(self.eigen.eigenvalues.iter())
            .for_each(|(beta, lambda)| *beta /= lambda.max(0f64) + mu);
        v * beta
    }
    /// Predicted contrast `xᵀAx - 2Bᵀx + c` of the correction `x`
    pub fn predicted_contrast(&self, x: &DVector<f64>) -> f64 {
        (&self.a * x).dot(x) - 2f64 * self.b.dot(x) + self.c
    }
    fn trial(&self, mu: f64) -> Trial {
        let correction = self.solve(mu);
        let predicted = self.predicted_contrast(&correction);
        Trial {
            mu,
            correction,
            predicted,
        }
    }
    fn solution(&self, trial: Trial, converged: bool) -> StrokeMinSolution {
        StrokeMinSolution {
            predicted_contrast_delta: trial.predicted - self.c,
            predicted_contrast: trial.predicted,
            contrast: self.c,
            correction: trial.correction,
            mu: trial.mu,
            converged,
        }
    }
    /// Searches the Tikhonov parameter for a predicted contrast of `gamma` times the contrast
    ///
    /// The search starts from `mu_start` and steps `μ` by `mu_step` until the
    /// target is bracketed, the bracket is then refined by geometric bisection.
    /// The returned correction always meets the target when the search converges,
    /// otherwise the best candidate is returned.
    pub fn line_search(&self, gamma: f64, mu_start: f64, mu_step: f64) -> Result<StrokeMinSolution> {
        if !(gamma > 0f64 && gamma < 1f64) {
            return Err(Error::Parameter {
                name: "contrast reduction factor",
                value: gamma,
            });
        }
        if !(mu_step > 1f64) {
            return Err(Error::Parameter {
                name: "Tikhonov parameter step",
                value: mu_step,
            });
        }
        let mu_start = if mu_start.is_finite() && mu_start > 0f64 {
            mu_start.clamp(MU_MIN, MU_MAX)
        } else {
            MU_MIN
        };
        if !(self.c > 0f64) {
            return Ok(StrokeMinSolution {
                correction: DVector::zeros(self.n_actuator()),
                mu: mu_start,
                contrast: self.c,
                predicted_contrast: self.c,
                predicted_contrast_delta: 0f64,
                converged: true,
            });
        }
        let target = gamma * self.c;
        let first = self.trial(mu_start);
        let (mut good, mut bad) = if first.predicted <= target {
            // correction too aggressive: increase μ until the target is missed
            let mut good = first;
            let mut bracket = None;
            for _ in 0..MAX_BRACKETING_STEPS {
                let mu = good.mu * mu_step;
                if mu > MU_MAX {
                    break;
                }
                let trial = self.trial(mu);
                if trial.predicted > target {
                    bracket = Some(trial);
                    break;
                }
                good = trial;
            }
            match bracket {
                Some(bad) => (good, bad),
                None => {
                    log::debug!("Tikhonov parameter upper bound reached with μ={:.3e}", good.mu);
                    return Ok(self.solution(good, true));
                }
            }
        } else {
            // not aggressive enough: decrease μ until the target is met
            let mut bad = first;
            let mut bracket = None;
            for _ in 0..MAX_BRACKETING_STEPS {
                let mu = bad.mu / mu_step;
                if mu < MU_MIN {
                    break;
                }
                let trial = self.trial(mu);
                if !trial.predicted.is_finite()
                    || trial.predicted < 0f64
                    || trial.predicted > 2f64 * bad.predicted
                {
                    log::warn!(
                        "Bad predicted contrast ({:.3e}) at μ={:.3e}, keeping μ={:.3e}",
                        trial.predicted,
                        mu,
                        bad.mu
                    );
                    return Ok(self.solution(bad, false));
                }
                if trial.predicted <= target {
                    bracket = Some(trial);
                    break;
                }
                bad = trial;
            }
            match bracket {
                Some(good) => (good, bad),
                None => {
                    log::warn!(
                        "Predicted contrast {:.3e} misses the target {:.3e} down to μ={:.3e}",
                        bad.predicted,
                        target,
                        bad.mu
                    );
                    return Ok(self.solution(bad, false));
                }
            }
        };
        for _ in 0..MAX_REFINEMENTS {
            if target - good.predicted <= TARGET_TOLERANCE * target {
                break;
            }
            let trial = self.trial((good.mu * bad.mu).sqrt());
            if trial.predicted <= target {
                good = trial;
            } else {
                bad = trial;
            }
        }
        log::debug!(
            "μ={:.3e}: predicted contrast {:.3e} for a target of {:.3e}",
            good.mu,
            good.predicted,
            target
        );
        Ok(self.solution(good, true))
    }
}

/// Monochromatic stroke minimization
pub fn stroke_minimization(
    jacobian: &Jacobian,
    field: &DVector<Complex<f64>>,
    dark_zone: &DarkZone,
    gamma: f64,
    mu_start: f64,
    mu_step: f64,
) -> Result<StrokeMinSolution> {
    let m = jacobian.dark_zone_response(dark_zone)?;
    StrokeMinProblem::new(&m, field)?.line_search(gamma, mu_start, mu_step)
}

/// Broadband stroke minimization
///
/// The quadratic models of each wavelength are summed with weights of
/// `control_weights × spectral_weights`, wavelengths with a zero weight are ignored.
/// `jacobians` are the dark zone Jacobians.
pub fn broadband_stroke_minimization(
    jacobians: &ByWavelength<DMatrix<f64>>,
    fields: &ByWavelength<DVector<Complex<f64>>>,
    spectral_weights: &ByWavelength<f64>,
    control_weights: &ByWavelength<f64>,
    gamma: f64,
    mu_start: f64,
    mu_step: f64,
) -> Result<StrokeMinSolution> {
    let mut terms = vec![];
    for (wavelength, m) in jacobians.iter() {
        let weight = control_weights.get(wavelength)? * spectral_weights.get(wavelength)?;
        terms.push((weight, m, fields.get(wavelength)?));
    }
    StrokeMinProblem::weighted(terms)?.line_search(gamma, mu_start, mu_step)
}
