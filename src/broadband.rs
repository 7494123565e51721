use crate::{
    config::{ChannelConfig, StrokeMinConfig},
    control::{self, Phase, Step, WavefrontControl},
    devices::DeviceContext,
    estimator::{self, PairwiseRequest},
    exposure::{image_peak, ExposureRequest, ExposureType},
    history::{History, IterationRecord},
    optics::{mean_intensity, ActuatorLayout, ByWavelength, DarkZone, Wavelength},
    persistence,
    probes::ProbeSet,
    solver,
    stroke_min::{autoscale, incoherent_background, ChannelModel, LoopState},
    ActuatorState, Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector};
use std::{fs, path::Path};

/// State of a wavelength channel
struct Channel {
    config: ChannelConfig,
    probes: ProbeSet,
    flux_attenuation: f64,
    direct_peak: f64,
    /// Latest coronagraphic image normalized to the direct peak
    image: Option<DVector<f64>>,
    dark_zone_snr: Option<f64>,
    probe_snr: Option<f64>,
}
impl Channel {
    fn take_direct(
        &mut self,
        state: &mut LoopState,
        devices: &mut DeviceContext,
        wavelength: Wavelength,
        path: &Path,
    ) -> Result<()> {
        let (direct, _) = state.exposer.take_exposure(
            devices,
            &ExposureRequest::new(
                &state.actuators.dm1,
                &state.actuators.dm2,
                wavelength,
                ExposureType::Direct,
                path,
            )
            .nd_filter(self.config.nd_direct.as_deref())
            .flux_attenuation_factor(self.flux_attenuation),
        )?;
        self.direct_peak = image_peak(&direct)?;
        Ok(())
    }
    fn take_coron(
        &mut self,
        state: &mut LoopState,
        devices: &mut DeviceContext,
        wavelength: Wavelength,
        path: &Path,
    ) -> Result<()> {
        let (coron, header) = state.exposer.take_exposure(
            devices,
            &ExposureRequest::new(
                &state.actuators.dm1,
                &state.actuators.dm2,
                wavelength,
                ExposureType::Coron,
                path,
            )
            .nd_filter(self.config.nd_coron.as_deref())
            .dark_zone(self.probes.dark_zone()),
        )?;
        self.dark_zone_snr = header.get_f64("SNR_DZ").filter(|snr| *snr > 0f64);
        self.image = Some(coron / self.direct_peak);
        Ok(())
    }
    fn image(&self) -> Result<&DVector<f64>> {
        self.image
            .as_ref()
            .ok_or_else(|| Error::OutOfSequence("no reference image".into()))
    }
}

/// Lowest of the available SNRs
pub(crate) fn faintest<I: IntoIterator<Item = Option<f64>>>(snrs: I) -> Option<f64> {
    snrs.into_iter()
        .flatten()
        .fold(None, |min: Option<f64>, snr| Some(min.map_or(snr, |m| m.min(snr))))
}

/// Whether the probe or the dark zone SNR is below the target
pub(crate) fn needs_more_exposures(probe_snr: Option<f64>, dark_zone_snr: Option<f64>, target: f64) -> bool {
    [probe_snr, dark_zone_snr]
        .into_iter()
        .flatten()
        .any(|snr| snr < target)
}

/// Broadband stroke minimization
///
/// The dark zone electric field is estimated at every wavelength and a single
/// DM correction minimizes the contrast weighted over the wavelengths.
/// Contrasts are spectrally weighted means of the per-wavelength contrasts.
pub struct BroadbandStrokeMinimization {
    config: StrokeMinConfig,
    channels: ByWavelength<Channel>,
    /// Dark zone Jacobians
    jacobians: ByWavelength<DMatrix<f64>>,
    spectral_weights: ByWavelength<f64>,
    control_weights: ByWavelength<f64>,
    dark_zone: DarkZone,
    state: LoopState,
    broadband_image: Option<DVector<f64>>,
}
impl BroadbandStrokeMinimization {
    /// Loads the Jacobians and the probes of all the channels and creates the run directory
    pub fn new(config: StrokeMinConfig) -> Result<Self> {
        config.validate()?;
        let layout: ActuatorLayout = config.dm.layout()?;
        let mut channels = vec![];
        let mut jacobians = vec![];
        let mut dm_settings = None;
        for channel in config.channels()?.values() {
            let wavelength = Wavelength(channel.wavelength);
            let model = ChannelModel::load(&config, channel, &layout)?;
            if dm_settings.is_none() {
                dm_settings = model.dm_settings;
            }
            jacobians.push((wavelength, model.jacobian));
            channels.push((
                wavelength,
                Channel {
                    config: channel.clone(),
                    probes: model.probes,
                    flux_attenuation: 1f64,
                    direct_peak: f64::NAN,
                    image: None,
                    dark_zone_snr: None,
                    probe_snr: None,
                },
            ));
        }
        let channels = ByWavelength::new(channels)?;
        let dark_zone = channels
            .values()
            .next()
            .map(|channel| channel.probes.dark_zone().clone())
            .ok_or(Error::NoChannel)?;
        for channel in channels.values() {
            let other = channel.probes.dark_zone();
            if other.len() != dark_zone.len() {
                return Err(Error::dimension("dark zone pixels", dark_zone.len(), other.len()));
            }
            if other.grid_size() != dark_zone.grid_size() {
                return Err(Error::dimension(
                    "focal-plane grid",
                    dark_zone.grid_size(),
                    other.grid_size(),
                ));
            }
        }
        let spectral_weights = channels.map(|_, channel| channel.config.spectral_weight);
        let control_weights = channels.map(|_, channel| channel.config.control_weight);
        let state = LoopState::new(
            &config,
            layout,
            dm_settings.as_ref(),
            dark_zone.grid(),
            channels.wavelengths().map(|w| w.nm()).collect(),
        )?;
        for (wavelength, channel) in channels.iter() {
            persistence::archive_probes(
                state.run.probes().join(format!("{:.0}nm", wavelength.nm())),
                &channel.probes,
                &state.layout,
            )?;
        }
        log::info!(
            "Broadband stroke minimization over {} wavelengths",
            channels.len()
        );
        Ok(Self {
            config,
            channels,
            jacobians: ByWavelength::new(jacobians)?,
            spectral_weights,
            control_weights,
            dark_zone,
            state,
            broadband_image: None,
        })
    }
    pub fn actuators(&self) -> &ActuatorState {
        &self.state.actuators
    }
    pub fn mu(&self) -> f64 {
        self.state.mu
    }
    pub fn last_correction(&self) -> Option<&DVector<f64>> {
        self.state.last_correction.as_ref()
    }
    pub fn run_directory(&self) -> &Path {
        self.state.run.path()
    }
    pub fn num_exposures(&self) -> usize {
        self.state.exposer.num_exposures()
    }
    /// Flux attenuation factor of each wavelength
    pub fn flux_attenuation(&self) -> ByWavelength<f64> {
        self.channels.map(|_, channel| channel.flux_attenuation)
    }
    fn take_images(&mut self, devices: &mut DeviceContext, path: &Path, direct: bool) -> Result<f64> {
        // the FPM moves once for all the direct images and once for all the coronagraphic images
        if direct {
            for (wavelength, channel) in self.channels.iter_mut() {
                channel.take_direct(&mut self.state, devices, wavelength, path)?;
            }
        }
        for (wavelength, channel) in self.channels.iter_mut() {
            channel.take_coron(&mut self.state, devices, wavelength, path)?;
        }
        let images = self.channels.try_map(|_, channel| channel.image().cloned())?;
        let broadband = images.weighted_mean(&self.spectral_weights)?;
        let contrast = self.dark_zone.mean(&broadband);
        self.broadband_image = Some(broadband);
        Ok(contrast)
    }
    /// Doubles the number of exposures if the faintest probe or dark zone image is too noisy
    fn check_snr(&mut self) {
        let probe_snr = faintest(self.channels.values().map(|channel| channel.probe_snr));
        let dark_zone_snr = faintest(self.channels.values().map(|channel| channel.dark_zone_snr));
        let num_exposures = self.state.exposer.num_exposures();
        log::info!(
            "Faintest SNR per pixel: probes {:.2?}, dark zone {:.2?} with {} exposures",
            probe_snr,
            dark_zone_snr,
            num_exposures
        );
        if self.config.auto_num_exposures
            && needs_more_exposures(probe_snr, dark_zone_snr, self.config.target_snr_per_pix)
        {
            self.state.exposer.set_num_exposures(2 * num_exposures);
            log::warn!(
                "SNR per pixel below {}, doubling the number of exposures to {}",
                self.config.target_snr_per_pix,
                2 * num_exposures
            );
        }
    }
}

/// Per-wavelength estimation outputs
struct Estimate {
    field: DVector<Complex<f64>>,
    pairwise_contrast: f64,
    probe_contrast: f64,
    scale_factor: f64,
}

impl WavefrontControl for BroadbandStrokeMinimization {
    fn take_reference_images(&mut self, devices: &mut DeviceContext) -> Result<()> {
        self.state.start_reference_images()?;
        for (wavelength, channel) in self.channels.iter_mut() {
            channel.flux_attenuation = self.state.flux_attenuation(
                devices,
                wavelength,
                channel.config.nd_direct.as_deref(),
                channel.config.nd_coron.as_deref(),
            )?;
        }
        let path = self.state.run.before();
        let contrast = self.take_images(devices, &path, true)?;
        self.state.record_initial(devices, contrast)?;
        self.state.advance(0, self.config.num_iterations);
        Ok(())
    }

    fn iterate(&mut self, devices: &mut DeviceContext) -> Result<()> {
        let i = self.state.iteration()?;
        let iteration_dir = self.state.run.iteration(i);
        fs::create_dir_all(&iteration_dir)?;
        let broadband_before = self
            .broadband_image
            .clone()
            .ok_or_else(|| Error::OutOfSequence("no reference image".into()))?;
        let last_contrast = self.state.history.last_contrast();
        let control = &self.config.control;

        log::info!("Iteration #{i}: {}", Step::Estimating);
        let mut estimates = vec![];
        for (wavelength, channel) in self.channels.iter_mut() {
            let dark_zone = channel.probes.dark_zone();
            let image_before = channel.image()?.clone();
            let estimate = if channel.config.control_weight == 0f64 {
                // not controlled, no probing
                channel.probe_snr = None;
                let field = DVector::from_element(dark_zone.len(), Complex::new(0f64, 0f64));
                Estimate {
                    pairwise_contrast: 0f64,
                    probe_contrast: mean_intensity(&field),
                    scale_factor: 1f64,
                    field,
                }
            } else if control.perfect_knowledge_mode {
                let oracle = devices.oracle.as_mut().ok_or(Error::NoFieldOracle)?;
                let field = estimator::perfect_knowledge(
                    &mut **oracle,
                    &self.state.actuators.dm1,
                    &self.state.actuators.dm2,
                    wavelength,
                    dark_zone,
                )?;
                Estimate {
                    pairwise_contrast: mean_intensity(&field),
                    probe_contrast: dark_zone.mean(&image_before),
                    scale_factor: 1f64,
                    field,
                }
            } else {
                log::info!("Pairwise probing at {}", wavelength);
                let exposer = &mut self.state.exposer;
                let nd_coron = channel.config.nd_coron.as_deref();
                let estimate = estimator::take_electric_field_pairwise(
                    PairwiseRequest {
                        dm1: &self.state.actuators.dm1,
                        dm2: &self.state.actuators.dm2,
                        probes: &channel.probes,
                        layout: &self.state.layout,
                        wavelength,
                        direct_peak: channel.direct_peak,
                        current_contrast: if i > 0 { last_contrast } else { None },
                        control_weight: channel.config.control_weight,
                    },
                    |dm1, dm2, suffix, wavelength| {
                        exposer.take_exposure(
                            devices,
                            &ExposureRequest::new(
                                dm1,
                                dm2,
                                wavelength,
                                ExposureType::Coron,
                                &iteration_dir,
                            )
                            .suffix(suffix)
                            .nd_filter(nd_coron)
                            .dark_zone(dark_zone),
                        )
                    },
                )?;
                channel.probe_snr = estimate.probe_snr;
                persistence::save_field(
                    iteration_dir.join(format!("E_estimated_unscaled_{:.0}nm.fits", wavelength.nm())),
                    dark_zone,
                    &estimate.field,
                )?;
                let probe_contrast = estimate
                    .probe_example
                    .as_ref()
                    .map_or_else(|| dark_zone.mean(&image_before), |image| dark_zone.mean(image));
                let mut field = estimate.field;
                let scale_factor = if control.autoscale_e_field {
                    let factor = autoscale(&mut field, dark_zone.mean(&image_before));
                    log::info!("Scaling the {} field estimate by {:.3}", wavelength, factor);
                    factor
                } else {
                    1f64
                };
                Estimate {
                    pairwise_contrast: mean_intensity(&field),
                    probe_contrast,
                    scale_factor,
                    field,
                }
            };
            estimates.push((wavelength, estimate));
        }
        let estimates = ByWavelength::new(estimates)?;
        let fields = estimates.map(|_, estimate| estimate.field.clone());
        let pairwise_contrast = estimates
            .map(|_, estimate| estimate.pairwise_contrast)
            .weighted_mean(&self.control_weights)?;
        let probe_contrast = estimates
            .map(|_, estimate| estimate.probe_contrast)
            .weighted_mean(&self.control_weights)?;
        log::info!("Pairwise contrast: {:.3e}", pairwise_contrast);

        let gamma = self.state.gamma.gamma(i);
        log::info!("Iteration #{i}: {} (γ={gamma})", Step::Solving);
        let solution = solver::broadband_stroke_minimization(
            &self.jacobians,
            &fields,
            &self.spectral_weights,
            &self.control_weights,
            gamma,
            self.state.mu,
            control.mu_step_factor,
        )?;
        if !solution.converged {
            log::warn!("Tikhonov parameter search did not converge, using μ={:.3e}", solution.mu);
        }
        self.state.mu = solution.mu;
        let solution = solution.scaled(control.control_gain);

        log::info!("Iteration #{i}: {}", Step::Applying);
        let correction_ptv = control::peak_to_valley(&solution.correction);
        let ceiling = control.max_correction_ptv;
        let direct = i % control.direct_every == 0;
        self.state
            .apply(devices, solution.correction, ceiling, &iteration_dir, i)?;

        log::info!("Iteration #{i}: {}", Step::Imaging);
        let environment = devices.temp_humidity();
        self.state.pupil_image(devices, &iteration_dir)?;
        let contrast = self.take_images(devices, &iteration_dir, direct)?;

        log::info!("Iteration #{i}: {}", Step::Recording);
        let measured_delta = contrast - last_contrast.unwrap_or(f64::NAN);
        log::info!(
            "Mean dark zone contrast: {:.3e} (predicted {:.3e}, Δ measured {:.3e} vs predicted {:.3e})",
            contrast,
            solution.predicted_contrast,
            measured_delta,
            solution.predicted_contrast_delta
        );
        let intensity = fields
            .map(|_, field| field.map(|e| e.norm_sqr()))
            .weighted_mean(&self.control_weights)?;
        self.state.record(IterationRecord {
            iteration: i,
            timestamp: persistence::timestamp(),
            gamma,
            mu: self.state.mu,
            num_exposures: self.state.exposer.num_exposures(),
            mean_contrast_image: contrast,
            mean_contrast_pairwise: pairwise_contrast,
            mean_contrast_probe: probe_contrast,
            predicted_contrast: solution.predicted_contrast,
            predicted_contrast_delta: solution.predicted_contrast_delta,
            measured_contrast_delta: measured_delta,
            estimated_incoherent_background: incoherent_background(
                &self.dark_zone.select(&broadband_before),
                &intensity,
            ),
            e_field_scale_factors: estimates.values().map(|estimate| estimate.scale_factor).collect(),
            correction_ptv,
            temperature: environment.map(|(t, _)| t),
            humidity: environment.map(|(_, h)| h),
        })?;
        self.check_snr();
        self.state.advance(i + 1, self.config.num_iterations);
        Ok(())
    }

    fn phase(&self) -> Phase {
        self.state.phase
    }

    fn history(&self) -> &History {
        &self.state.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faintest_snr() {
        assert_eq!(faintest([Some(12.), None, Some(8.)]), Some(8.));
        assert_eq!(faintest([None, None]), None);
    }

    #[test]
    fn exposure_doubling() {
        assert!(needs_more_exposures(Some(5.), Some(20.), 10.));
        assert!(needs_more_exposures(Some(20.), Some(5.), 10.));
        assert!(needs_more_exposures(None, Some(5.), 10.));
        assert!(!needs_more_exposures(Some(10.), Some(11.), 10.));
        assert!(!needs_more_exposures(None, None, 10.));
    }
}
