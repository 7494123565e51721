//! # Experiment configuration
//!
//! Stroke minimization runs are configured from a TOML file, e.g.
//!
//! ```toml
//! suffix = "broadband_stroke_minimization"
//! data_root = "data"
//! num_iterations = 30
//!
//! [control]
//! gamma = 0.8
//! control_gain = 1.0
//!
//! [[channel]]
//! wavelength = 640.0
//! jacobian = "jacobian_640nm.fits"
//! probes = "probes_640nm.fits"
//! nd_direct = "9_percent"
//! nd_coron = "clear_1"
//! ```
//!
//! Every field not given takes its default value.

use crate::{
    exposure::ExposureSettings,
    optics::{ActuatorLayout, ByWavelength, Wavelength},
    persistence::ResumeSettings,
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Control law settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Target contrast reduction factor of each iteration, in (0,1)
    pub gamma: f64,
    /// Use the gentler contrast reduction factors of the first 20 iterations
    pub auto_adjust_gamma: bool,
    /// Fraction of the correction applied to the DMs, in [0,1]
    pub control_gain: f64,
    /// Starting Tikhonov parameter
    pub mu_start: f64,
    /// Tikhonov parameter search step factor
    pub mu_step_factor: f64,
    /// Largest DM correction peak-to-valley [nm]
    pub max_correction_ptv: f64,
    /// Direct image cadence, in iterations
    pub direct_every: usize,
    /// Control with DM2 as well as DM1
    pub use_dm2: bool,
    /// Scale the estimated electric field to the measured contrast
    pub autoscale_e_field: bool,
    /// Use the true electric field of a simulated testbed instead of probing
    pub perfect_knowledge_mode: bool,
}
impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            gamma: 0.8,
            auto_adjust_gamma: false,
            control_gain: 1f64,
            mu_start: 1e-7,
            mu_step_factor: 1.3,
            max_correction_ptv: 200f64,
            direct_every: 1,
            use_dm2: true,
            autoscale_e_field: false,
            perfect_knowledge_mode: false,
        }
    }
}

/// DM actuator layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmSettings {
    /// FITS file with the actuator mask, all the actuators of the grid are used otherwise
    pub actuator_mask: Option<PathBuf>,
    /// Actuator grid (rows,columns)
    pub actuator_grid: (usize, usize),
}
impl Default for DmSettings {
    fn default() -> Self {
        Self {
            actuator_mask: None,
            actuator_grid: (34, 34),
        }
    }
}
impl DmSettings {
    pub fn layout(&self) -> Result<ActuatorLayout> {
        match &self.actuator_mask {
            Some(path) => ActuatorLayout::from_fits(path),
            None => Ok(ActuatorLayout::full(
                self.actuator_grid.0,
                self.actuator_grid.1,
            )),
        }
    }
}

/// A wavelength channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Wavelength [nm]
    pub wavelength: f64,
    pub jacobian: PathBuf,
    pub probes: PathBuf,
    /// ND filter of the direct images
    pub nd_direct: Option<String>,
    /// ND filter of the coronagraphic images
    pub nd_coron: Option<String>,
    #[serde(default = "unit_weight")]
    pub control_weight: f64,
    #[serde(default = "unit_weight")]
    pub spectral_weight: f64,
}
fn unit_weight() -> f64 {
    1f64
}

/// Stroke minimization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrokeMinConfig {
    /// Run directory suffix
    pub suffix: String,
    /// Directory the run directories are created into
    pub data_root: PathBuf,
    pub num_iterations: usize,
    /// Coronagraph mode the Jacobians must have been computed for
    pub coronagraph_mode: Option<String>,
    /// Double the number of exposures when the dark zone or probe SNR drops below the target
    pub auto_num_exposures: bool,
    pub target_snr_per_pix: f64,
    pub control: ControlSettings,
    pub exposure: ExposureSettings,
    pub resume: ResumeSettings,
    pub dm: DmSettings,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}
impl Default for StrokeMinConfig {
    fn default() -> Self {
        Self {
            suffix: "stroke_minimization".into(),
            data_root: PathBuf::from("data"),
            num_iterations: 10,
            coronagraph_mode: None,
            auto_num_exposures: true,
            target_snr_per_pix: 10f64,
            control: ControlSettings::default(),
            exposure: ExposureSettings::default(),
            resume: ResumeSettings::default(),
            dm: DmSettings::default(),
            channels: vec![],
        }
    }
}
impl StrokeMinConfig {
    /// Parses a TOML configuration
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
    /// Loads a TOML configuration file, relative paths of the file are resolved against its directory
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::from_toml(&fs::read_to_string(path)?)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }
    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        resolve(&mut self.data_root);
        if let Some(p) = self.dm.actuator_mask.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.resume.dm_command_dir.as_mut() {
            resolve(p);
        }
        for channel in self.channels.iter_mut() {
            resolve(&mut channel.jacobian);
            resolve(&mut channel.probes);
        }
    }
    /// Checks the settings ranges
    pub fn validate(&self) -> Result<()> {
        let control = &self.control;
        if !(control.gamma > 0f64 && control.gamma < 1f64) {
            return Err(Error::Parameter {
                name: "gamma",
                value: control.gamma,
            });
        }
        if !(0f64..=1f64).contains(&control.control_gain) {
            return Err(Error::Parameter {
                name: "control gain",
                value: control.control_gain,
            });
        }
        if !(control.mu_step_factor > 1f64) {
            return Err(Error::Parameter {
                name: "mu step factor",
                value: control.mu_step_factor,
            });
        }
        if !(control.mu_start > 0f64) {
            return Err(Error::Parameter {
                name: "mu start",
                value: control.mu_start,
            });
        }
        if control.direct_every == 0 {
            return Err(Error::Parameter {
                name: "direct image cadence",
                value: 0f64,
            });
        }
        if self.channels.is_empty() {
            return Err(Error::NoChannel);
        }
        Ok(())
    }
    /// Channel wavelengths
    pub fn wavelengths(&self) -> Vec<Wavelength> {
        self.channels
            .iter()
            .map(|channel| Wavelength(channel.wavelength))
            .collect()
    }
    /// Channels keyed by wavelength
    pub fn channels(&self) -> Result<ByWavelength<ChannelConfig>> {
        ByWavelength::new(
            self.channels
                .iter()
                .map(|channel| (Wavelength(channel.wavelength), channel.clone())),
        )
    }
}
