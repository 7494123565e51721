use crate::{
    config::{ChannelConfig, StrokeMinConfig},
    control::{self, ActuatorState, GammaSchedule, Phase, Step, WavefrontControl},
    devices::{DeviceContext, DmCommand},
    estimator::{self, PairwiseEstimate, PairwiseRequest},
    exposure::{image_peak, Exposer, ExposureRequest, ExposureType},
    fits,
    history::{History, IterationRecord},
    optics::{mean_intensity, ActuatorLayout, Jacobian, Wavelength},
    persistence::{self, Checkpoint, MetricsLog, MetricsRow, RunDirectory},
    probes::ProbeSet,
    solver::StrokeMinProblem,
    Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector};
use std::{fs, path::Path};

/// Jacobian and probes of a wavelength channel
pub(crate) struct ChannelModel {
    /// Dark zone Jacobian
    pub jacobian: DMatrix<f64>,
    pub probes: ProbeSet,
    pub dm_settings: Option<(DVector<f64>, DVector<f64>)>,
}
impl ChannelModel {
    pub fn load(config: &StrokeMinConfig, channel: &ChannelConfig, layout: &ActuatorLayout) -> Result<Self> {
        let jacobian = Jacobian::load(&channel.jacobian)?;
        if let Some(expected) = config.coronagraph_mode.as_deref() {
            match jacobian.coronagraph_mode() {
                Some(found) if found != expected => {
                    return Err(Error::CoronagraphMode {
                        expected: expected.into(),
                        found: found.into(),
                    })
                }
                None => log::warn!(
                    "{:?} has no coronagraph mode, assuming {}",
                    channel.jacobian,
                    expected
                ),
                _ => (),
            }
        }
        let (jacobian, n_dm) = if config.control.use_dm2 {
            (jacobian, 2)
        } else {
            (jacobian.truncate(layout.len())?, 1)
        };
        if jacobian.n_actuator() != n_dm * layout.len() {
            return Err(Error::dimension(
                "Jacobian rows",
                n_dm * layout.len(),
                jacobian.n_actuator(),
            ));
        }
        let probes = ProbeSet::load(&channel.probes)?;
        if let Some(probe) = probes
            .probes()
            .iter()
            .find(|p| p.len() != layout.len() && p.len() != 2 * layout.len())
        {
            return Err(Error::dimension("probe actuators", layout.len(), probe.len()));
        }
        Ok(Self {
            jacobian: jacobian.dark_zone_response(probes.dark_zone())?,
            dm_settings: jacobian.dm_settings().cloned(),
            probes,
        })
    }
}

/// Loop state shared by the monochromatic and broadband control loops
pub(crate) struct LoopState {
    pub layout: ActuatorLayout,
    pub actuators: ActuatorState,
    pub gamma: GammaSchedule,
    pub mu: f64,
    pub exposer: Exposer,
    pub run: RunDirectory,
    pub metrics: MetricsLog,
    pub history: History,
    pub phase: Phase,
    pub last_correction: Option<DVector<f64>>,
}
impl LoopState {
    /// Selects the initial DM commands and creates the run directory
    pub fn new(
        config: &StrokeMinConfig,
        layout: ActuatorLayout,
        dm_settings: Option<&(DVector<f64>, DVector<f64>)>,
        grid: (usize, usize),
        wavelengths: Vec<f64>,
    ) -> Result<Self> {
        let initial = persistence::initial_state(
            &config.resume,
            &config.data_root,
            &config.suffix,
            &layout,
            dm_settings,
        )?;
        let mut gamma = GammaSchedule::new(config.control.gamma, config.control.auto_adjust_gamma);
        let mut mu = config.control.mu_start;
        let mut exposer = Exposer::new(config.exposure.clone(), grid);
        if initial.resumed_from.is_some() {
            if config.control.auto_adjust_gamma {
                log::warn!("Resuming: gamma auto-adjustment is disabled");
                gamma.disable();
            }
            if let Some(checkpoint) = &initial.checkpoint {
                log::info!(
                    "Resuming with μ={:.3e} and {} exposures",
                    checkpoint.mu,
                    checkpoint.num_exposures
                );
                mu = checkpoint.mu;
                exposer.set_num_exposures(checkpoint.num_exposures);
            }
        }
        let run = RunDirectory::create(&config.data_root, &config.suffix)?;
        Ok(Self {
            layout,
            actuators: initial.actuators,
            gamma,
            mu,
            exposer,
            metrics: MetricsLog::new(run.metrics()),
            run,
            history: History::new(wavelengths),
            phase: Phase::Initializing,
            last_correction: None,
        })
    }
    pub fn start_reference_images(&mut self) -> Result<()> {
        if self.phase != Phase::Initializing {
            return Err(Error::OutOfSequence(format!(
                "reference images can't be taken while {}",
                self.phase
            )));
        }
        self.phase = Phase::TakingReferenceImages;
        log::info!("Taking reference images");
        Ok(())
    }
    pub fn iteration(&self) -> Result<usize> {
        match self.phase {
            Phase::Iterating(i) => Ok(i),
            phase => Err(Error::OutOfSequence(format!(
                "can't run an iteration while {phase}"
            ))),
        }
    }
    /// Moves to the next iteration or finishes
    pub fn advance(&mut self, i: usize, num_iterations: usize) {
        self.phase = if i < num_iterations {
            Phase::Iterating(i)
        } else {
            log::info!("Stroke minimization done");
            Phase::Finished
        };
    }
    /// Scales, checks and applies a correction to the DMs and saves the new DM commands
    pub fn apply(
        &mut self,
        devices: &mut DeviceContext,
        correction: DVector<f64>,
        ceiling: f64,
        iteration_dir: &Path,
        iteration: usize,
    ) -> Result<()> {
        control::sanity_check(&correction, ceiling)?;
        self.actuators.apply_correction(&correction, &self.layout)?;
        devices.dm.apply_shape(&DmCommand {
            dm1: self.actuators.dm1.clone(),
            dm2: self.actuators.dm2.clone(),
        })?;
        persistence::save_dm_commands(iteration_dir, &self.layout, &self.actuators)?;
        Checkpoint {
            iteration,
            mu: self.mu,
            num_exposures: self.exposer.num_exposures(),
        }
        .save(iteration_dir)?;
        self.last_correction = Some(correction);
        Ok(())
    }
    /// Measures the flux attenuation factor between direct images taken with
    /// the `nd_direct` filter and with the `nd_coron` filter
    ///
    /// Direct image count rates multiplied by this factor are normalized as the
    /// coronagraphic ones. The factor is one if both filters are the same.
    pub fn flux_attenuation(
        &mut self,
        devices: &mut DeviceContext,
        wavelength: Wavelength,
        nd_direct: Option<&str>,
        nd_coron: Option<&str>,
    ) -> Result<f64> {
        if nd_direct == nd_coron {
            return Ok(1f64);
        }
        let path = self.run.flux_normalization();
        let mut peaks = [0f64; 2];
        for (peak, (nd_filter, suffix)) in peaks
            .iter_mut()
            .zip([(nd_direct, "nd_direct"), (nd_coron, "nd_coron")])
        {
            let (image, _) = self.exposer.take_exposure(
                devices,
                &ExposureRequest::new(
                    &self.actuators.dm1,
                    &self.actuators.dm2,
                    wavelength,
                    ExposureType::Direct,
                    &path,
                )
                .suffix(suffix)
                .nd_filter(nd_filter),
            )?;
            *peak = image_peak(&image)?;
        }
        let factor = peaks[1] / peaks[0];
        log::info!("Flux attenuation factor at {}: {:.3}", wavelength, factor);
        Ok(factor)
    }
    /// Saves a pupil image, failures are only logged
    pub fn pupil_image(&self, devices: &mut DeviceContext, iteration_dir: &Path) -> Result<()> {
        if let Some(camera) = devices.pupil_camera.as_mut() {
            match camera.capture(self.exposer.num_exposures()) {
                Ok(((rows, cols), image)) => {
                    fits::write_image(iteration_dir.join("pupil.fits"), vec![rows, cols], image)?
                }
                Err(e) => log::warn!("Pupil image failed: {}", e),
            }
        }
        Ok(())
    }
    /// Records the iteration, saving the history and the metrics
    pub fn record(&mut self, record: IterationRecord) -> Result<()> {
        self.metrics.append(&MetricsRow {
            timestamp: record.timestamp.clone(),
            temperature: record.temperature,
            humidity: record.humidity,
            mean_image_contrast: record.mean_contrast_image,
        })?;
        self.history.push(record);
        self.history.save(self.run.history())
    }
    /// Records the contrast before the first iteration
    pub fn record_initial(&mut self, devices: &mut DeviceContext, contrast: f64) -> Result<()> {
        log::info!("Initial mean dark zone contrast: {:.3e}", contrast);
        let environment = devices.temp_humidity();
        self.history.set_initial_contrast(contrast);
        self.metrics.append(&MetricsRow {
            timestamp: persistence::timestamp(),
            temperature: environment.map(|(t, _)| t),
            humidity: environment.map(|(_, h)| h),
            mean_image_contrast: contrast,
        })?;
        self.history.save(self.run.history())
    }
}

/// Scales a field estimate to the expected contrast, returns the scaling factor
pub(crate) fn autoscale(field: &mut DVector<Complex<f64>>, expected_contrast: f64) -> f64 {
    let estimated = mean_intensity(field);
    if estimated > 0f64 && expected_contrast > 0f64 {
        let factor = (expected_contrast / estimated).sqrt();
        *field *= Complex::new(factor, 0f64);
        factor
    } else {
        1f64
    }
}

/// Mean of `|image - |E|²|` over the dark zone
pub(crate) fn incoherent_background(image: &DVector<f64>, intensity: &DVector<f64>) -> f64 {
    if image.is_empty() {
        return f64::NAN;
    }
    (image - intensity).abs().mean()
}

/// Monochromatic stroke minimization
///
/// Every iteration estimates the dark zone electric field by pairwise probing,
/// computes the stroke minimization correction, applies it to the DMs and takes
/// a new coronagraphic image.
pub struct StrokeMinimization {
    config: StrokeMinConfig,
    wavelength: Wavelength,
    nd_direct: Option<String>,
    nd_coron: Option<String>,
    flux_attenuation: f64,
    model: ChannelModel,
    state: LoopState,
    direct_peak: f64,
    image: Option<DVector<f64>>,
}
impl StrokeMinimization {
    /// Loads the Jacobian and the probes of the first channel and creates the run directory
    pub fn new(config: StrokeMinConfig) -> Result<Self> {
        config.validate()?;
        let channel = config.channels.first().ok_or(Error::NoChannel)?.clone();
        if config.channels.len() > 1 {
            log::warn!(
                "Monochromatic stroke minimization at {}nm, ignoring the other channels",
                channel.wavelength
            );
        }
        let layout = config.dm.layout()?;
        let model = ChannelModel::load(&config, &channel, &layout)?;
        let grid = model.probes.dark_zone().grid();
        let state = LoopState::new(
            &config,
            layout,
            model.dm_settings.as_ref(),
            grid,
            vec![channel.wavelength],
        )?;
        persistence::archive_probes(state.run.probes(), &model.probes, &state.layout)?;
        Ok(Self {
            wavelength: Wavelength(channel.wavelength),
            nd_direct: channel.nd_direct,
            nd_coron: channel.nd_coron,
            flux_attenuation: 1f64,
            config,
            model,
            state,
            direct_peak: f64::NAN,
            image: None,
        })
    }
    pub fn actuators(&self) -> &ActuatorState {
        &self.state.actuators
    }
    /// Tikhonov parameter warm start of the next iteration
    pub fn mu(&self) -> f64 {
        self.state.mu
    }
    /// Last correction applied to the DMs, gain included
    pub fn last_correction(&self) -> Option<&DVector<f64>> {
        self.state.last_correction.as_ref()
    }
    pub fn run_directory(&self) -> &Path {
        self.state.run.path()
    }
    pub fn num_exposures(&self) -> usize {
        self.state.exposer.num_exposures()
    }
    fn take_direct(&mut self, devices: &mut DeviceContext, path: &Path) -> Result<()> {
        let (direct, _) = self.state.exposer.take_exposure(
            devices,
            &ExposureRequest::new(
                &self.state.actuators.dm1,
                &self.state.actuators.dm2,
                self.wavelength,
                ExposureType::Direct,
                path,
            )
            .nd_filter(self.nd_direct.as_deref())
            .flux_attenuation_factor(self.flux_attenuation),
        )?;
        self.direct_peak = image_peak(&direct)?;
        Ok(())
    }
    fn take_coron(&mut self, devices: &mut DeviceContext, path: &Path) -> Result<DVector<f64>> {
        let (coron, _) = self.state.exposer.take_exposure(
            devices,
            &ExposureRequest::new(
                &self.state.actuators.dm1,
                &self.state.actuators.dm2,
                self.wavelength,
                ExposureType::Coron,
                path,
            )
            .nd_filter(self.nd_coron.as_deref())
            .dark_zone(self.model.probes.dark_zone()),
        )?;
        Ok(coron / self.direct_peak)
    }
    fn estimate(
        &mut self,
        devices: &mut DeviceContext,
        iteration_dir: &Path,
        current_contrast: Option<f64>,
    ) -> Result<PairwiseEstimate> {
        let dark_zone = self.model.probes.dark_zone();
        if self.config.control.perfect_knowledge_mode {
            let oracle = devices.oracle.as_mut().ok_or(Error::NoFieldOracle)?;
            return Ok(PairwiseEstimate {
                field: estimator::perfect_knowledge(
                    &mut **oracle,
                    &self.state.actuators.dm1,
                    &self.state.actuators.dm2,
                    self.wavelength,
                    dark_zone,
                )?,
                probe_example: None,
                probe_snr: None,
                probe_scale: 0f64,
            });
        }
        let exposer = &mut self.state.exposer;
        let nd_coron = self.nd_coron.as_deref();
        estimator::take_electric_field_pairwise(
            PairwiseRequest {
                dm1: &self.state.actuators.dm1,
                dm2: &self.state.actuators.dm2,
                probes: &self.model.probes,
                layout: &self.state.layout,
                wavelength: self.wavelength,
                direct_peak: self.direct_peak,
                current_contrast,
                control_weight: 1f64,
            },
            |dm1, dm2, suffix, wavelength| {
                exposer.take_exposure(
                    devices,
                    &ExposureRequest::new(dm1, dm2, wavelength, ExposureType::Coron, iteration_dir)
                        .suffix(suffix)
                        .nd_filter(nd_coron)
                        .dark_zone(dark_zone),
                )
            },
        )
    }
}

impl WavefrontControl for StrokeMinimization {
    fn take_reference_images(&mut self, devices: &mut DeviceContext) -> Result<()> {
        self.state.start_reference_images()?;
        self.flux_attenuation = self.state.flux_attenuation(
            devices,
            self.wavelength,
            self.nd_direct.as_deref(),
            self.nd_coron.as_deref(),
        )?;
        let path = self.state.run.before();
        self.take_direct(devices, &path)?;
        let image = self.take_coron(devices, &path)?;
        let contrast = self.model.probes.dark_zone().mean(&image);
        self.state.record_initial(devices, contrast)?;
        self.image = Some(image);
        self.state.advance(0, self.config.num_iterations);
        Ok(())
    }

    fn iterate(&mut self, devices: &mut DeviceContext) -> Result<()> {
        let i = self.state.iteration()?;
        let iteration_dir = self.state.run.iteration(i);
        fs::create_dir_all(&iteration_dir)?;
        let image_before = self
            .image
            .clone()
            .ok_or_else(|| Error::OutOfSequence("no reference image".into()))?;
        let last_contrast = self.state.history.last_contrast();
        let dark_zone = self.model.probes.dark_zone().clone();

        log::info!("Iteration #{i}: {}", Step::Estimating);
        let estimate = self.estimate(
            devices,
            &iteration_dir,
            if i > 0 { last_contrast } else { None },
        )?;
        persistence::save_field(
            iteration_dir.join("E_estimated_unscaled.fits"),
            &dark_zone,
            &estimate.field,
        )?;
        let mut field = estimate.field;
        let scale_factor = if self.config.control.autoscale_e_field {
            autoscale(&mut field, dark_zone.mean(&image_before))
        } else {
            1f64
        };
        let pairwise_contrast = mean_intensity(&field);
        let probe_contrast = estimate
            .probe_example
            .as_ref()
            .map_or_else(|| dark_zone.mean(&image_before), |image| dark_zone.mean(image));

        let gamma = self.state.gamma.gamma(i);
        log::info!("Iteration #{i}: {} (γ={gamma})", Step::Solving);
        let solution = StrokeMinProblem::new(&self.model.jacobian, &field)?.line_search(
            gamma,
            self.state.mu,
            self.config.control.mu_step_factor,
        )?;
        if !solution.converged {
            log::warn!("Tikhonov parameter search did not converge, using μ={:.3e}", solution.mu);
        }
        self.state.mu = solution.mu;
        let solution = solution.scaled(self.config.control.control_gain);

        log::info!("Iteration #{i}: {}", Step::Applying);
        let correction_ptv = control::peak_to_valley(&solution.correction);
        self.state.apply(
            devices,
            solution.correction,
            self.config.control.max_correction_ptv,
            &iteration_dir,
            i,
        )?;

        log::info!("Iteration #{i}: {}", Step::Imaging);
        let environment = devices.temp_humidity();
        self.state.pupil_image(devices, &iteration_dir)?;
        if i % self.config.control.direct_every == 0 {
            self.take_direct(devices, &iteration_dir)?;
        }
        let image = self.take_coron(devices, &iteration_dir)?;
        let contrast = dark_zone.mean(&image);

        log::info!("Iteration #{i}: {}", Step::Recording);
        let measured_delta = contrast - last_contrast.unwrap_or(f64::NAN);
        log::info!(
            "Mean dark zone contrast: {:.3e} (predicted {:.3e}, Δ measured {:.3e} vs predicted {:.3e})",
            contrast,
            solution.predicted_contrast,
            measured_delta,
            solution.predicted_contrast_delta
        );
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
                &dark_zone.select(&image_before),
                &field.map(|e| e.norm_sqr()),
            ),
            e_field_scale_factors: vec![scale_factor],
            correction_ptv,
            temperature: environment.map(|(t, _)| t),
            humidity: environment.map(|(_, h)| h),
        })?;
        self.image = Some(image);
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
