//! # Linear testbed simulator
//!
//! A testbed whose focal-plane electric field responds linearly to the DMs:
//!
//! `E = E₀ + Jᵀ[dm1; dm2]`
//!
//! with the field in units of the square root of the direct image peak.
//! Coronagraphic images are `|E|²` plus an incoherent background, scaled by
//! the direct image peak count rate and the ND filter transmission.
//! All the simulated devices share the same testbed state.

use crate::{
    config::StrokeMinConfig,
    devices::{
        Camera, CaptureSettings, DeformableMirror, Device, DeviceContext, DeviceContextBuilder,
        DmCommand, FieldOracle, FilterWheel, FpmPositions, LaserSource, MotorAxis, PupilCamera,
        TemperatureSensor,
    },
    optics::{ActuatorLayout, ByWavelength, DarkZone, Jacobian, Wavelength},
    probes::ProbeSet,
    Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector};
use std::{cell::RefCell, rc::Rc};

const CLEAR: &str = "clear";
/// Transmission of the ND filters of the direct images
pub const ND_TRANSMISSION: f64 = 0.01;

#[derive(Debug)]
struct Channel {
    jacobian: Jacobian,
    aberration: DVector<Complex<f64>>,
}

#[derive(Debug)]
struct Bench {
    grid: (usize, usize),
    layout: ActuatorLayout,
    channels: ByWavelength<Channel>,
    dm: DmCommand,
    fpm: FpmPositions,
    fpm_position: f64,
    filters: Vec<(String, f64)>,
    filter: String,
    laser_current: f64,
    incoherent_background: f64,
    direct_peak: f64,
    failing_temperature_sensor: bool,
    failing_pupil_camera: bool,
    camera_failure_after: Option<usize>,
    frame_pixels: Option<usize>,
    captures: usize,
    open_devices: usize,
}
impl Bench {
    fn field(
        &self,
        dm1: &DVector<f64>,
        dm2: &DVector<f64>,
        wavelength: Wavelength,
    ) -> Result<DVector<Complex<f64>>> {
        let channel = self.channels.get(wavelength)?;
        let actuators = DVector::from_iterator(
            dm1.len() + dm2.len(),
            dm1.iter().chain(dm2.iter()).cloned(),
        );
        Ok(&channel.aberration + channel.jacobian.field_response(&actuators)?)
    }
    fn transmission(&self) -> Result<f64> {
        self.filters
            .iter()
            .find(|(name, _)| *name == self.filter)
            .map(|(_, t)| *t)
            .ok_or_else(|| Error::Device {
                device: "simulated ND filter wheel".into(),
                message: format!("unknown filter {}", self.filter),
            })
    }
    fn center(&self) -> usize {
        (self.grid.0 / 2) * self.grid.1 + self.grid.1 / 2
    }
}

/// Simulated testbed
#[derive(Debug, Clone)]
pub struct LinearTestbed {
    bench: Rc<RefCell<Bench>>,
}
impl LinearTestbed {
    /// Creates a testbed from the Jacobian and the static aberration field of each wavelength
    ///
    /// Jacobians must cover the whole focal-plane `grid` and have as many rows as
    /// actuators of DM1 or of both DMs.
    pub fn new(
        grid: (usize, usize),
        layout: ActuatorLayout,
        channels: ByWavelength<(Jacobian, DVector<Complex<f64>>)>,
    ) -> Result<Self> {
        let n_grid = grid.0 * grid.1;
        let channels = channels.try_map(|_, (jacobian, aberration)| {
            if jacobian.matrix().ncols() != 2 * n_grid {
                return Err(Error::dimension(
                    "simulated Jacobian columns",
                    2 * n_grid,
                    jacobian.matrix().ncols(),
                ));
            }
            let rows = jacobian.n_actuator();
            if rows != layout.len() && rows != 2 * layout.len() {
                return Err(Error::dimension(
                    "simulated Jacobian rows",
                    2 * layout.len(),
                    rows,
                ));
            }
            if aberration.len() != n_grid {
                return Err(Error::dimension(
                    "simulated aberration",
                    n_grid,
                    aberration.len(),
                ));
            }
            Ok(Channel {
                jacobian: jacobian.clone(),
                aberration: aberration.clone(),
            })
        })?;
        let fpm = FpmPositions::default();
        let n = layout.len();
        Ok(Self {
            bench: Rc::new(RefCell::new(Bench {
                grid,
                channels,
                dm: DmCommand {
                    dm1: DVector::zeros(n),
                    dm2: DVector::zeros(n),
                },
                layout,
                fpm,
                fpm_position: fpm.coron,
                filters: vec![(CLEAR.to_string(), 1f64)],
                filter: CLEAR.to_string(),
                laser_current: 0f64,
                incoherent_background: 0f64,
                direct_peak: 1e6,
                failing_temperature_sensor: false,
                failing_pupil_camera: false,
                camera_failure_after: None,
                frame_pixels: None,
                captures: 0,
                open_devices: 0,
            })),
        })
    }
    /// Creates the testbed of the channels of a stroke minimization configuration
    ///
    /// The Jacobians of the channels must cover the focal-plane grid of the probe
    /// dark zones. The static aberration of each channel is the field response
    /// to the `aberration` DM commands [nm], DM1 then DM2. The direct image ND
    /// filters have a transmission of [ND_TRANSMISSION], the coronagraphic ones are clear.
    pub fn from_config(config: &StrokeMinConfig, aberration: &DVector<f64>) -> Result<Self> {
        let layout = config.dm.layout()?;
        let mut grid = None;
        let mut channels = vec![];
        for channel in &config.channels {
            let jacobian = Jacobian::load(&channel.jacobian)?;
            if grid.is_none() {
                grid = Some(ProbeSet::load(&channel.probes)?.dark_zone().grid());
            }
            let field = jacobian.field_response(aberration)?;
            channels.push((Wavelength(channel.wavelength), (jacobian, field)));
        }
        let grid = grid.ok_or(Error::NoChannel)?;
        let mut testbed = Self::new(grid, layout, ByWavelength::new(channels)?)?
            .fpm_positions(config.exposure.fpm);
        for channel in &config.channels {
            if let Some(name) = &channel.nd_coron {
                testbed = testbed.nd_filter(name, 1f64);
            }
        }
        for channel in &config.channels {
            if let Some(name) = channel.nd_direct.as_ref().filter(|&name| Some(name) != channel.nd_coron.as_ref()) {
                testbed = testbed.nd_filter(name, ND_TRANSMISSION);
            }
        }
        Ok(testbed)
    }
    /// A dark testbed with a flat DM response
    pub fn toy(grid: (usize, usize), layout: ActuatorLayout, wavelength: f64) -> Self {
        let n_grid = grid.0 * grid.1;
        let bench = Bench {
            grid,
            channels: ByWavelength::single(
                Wavelength(wavelength),
                Channel {
                    jacobian: Jacobian::new(DMatrix::zeros(layout.len(), 2 * n_grid)),
                    aberration: DVector::from_element(n_grid, Complex::new(0f64, 0f64)),
                },
            ),
            dm: DmCommand {
                dm1: DVector::zeros(layout.len()),
                dm2: DVector::zeros(layout.len()),
            },
            layout,
            fpm: FpmPositions::default(),
            fpm_position: 0f64,
            filters: vec![(CLEAR.to_string(), 1f64)],
            filter: CLEAR.to_string(),
            laser_current: 0f64,
            incoherent_background: 0f64,
            direct_peak: 1e6,
            failing_temperature_sensor: false,
            failing_pupil_camera: false,
            camera_failure_after: None,
            frame_pixels: None,
            captures: 0,
            open_devices: 0,
        };
        Self {
            bench: Rc::new(RefCell::new(bench)),
        }
    }
    /// Sets the direct image peak count rate [counts/s]
    pub fn direct_peak(self, rate: f64) -> Self {
        self.bench.borrow_mut().direct_peak = rate;
        self
    }
    /// Sets the incoherent background, in contrast units
    pub fn incoherent_background(self, background: f64) -> Self {
        self.bench.borrow_mut().incoherent_background = background;
        self
    }
    /// Adds a ND filter and its transmission
    pub fn nd_filter(self, name: &str, transmission: f64) -> Self {
        {
            let mut bench = self.bench.borrow_mut();
            bench.filters.retain(|(n, _)| n != name);
            bench.filters.push((name.to_string(), transmission));
        }
        self
    }
    pub fn fpm_positions(self, fpm: FpmPositions) -> Self {
        self.bench.borrow_mut().fpm = fpm;
        self
    }
    /// Makes the temperature sensor fail on every reading
    pub fn failing_temperature_sensor(self) -> Self {
        self.bench.borrow_mut().failing_temperature_sensor = true;
        self
    }
    /// Makes the pupil camera fail on every capture
    pub fn failing_pupil_camera(self) -> Self {
        self.bench.borrow_mut().failing_pupil_camera = true;
        self
    }
    /// Makes the camera fail on every capture after the first `captures` ones
    pub fn failing_camera_after(self, captures: usize) -> Self {
        self.bench.borrow_mut().camera_failure_after = Some(captures);
        self
    }
    /// Makes the camera read out only the first `pixels` pixels of the focal plane
    pub fn cropped_frames(self, pixels: usize) -> Self {
        self.bench.borrow_mut().frame_pixels = Some(pixels);
        self
    }
    /// Focal-plane electric field for the given DM commands [nm]
    pub fn field(
        &self,
        dm1: &DVector<f64>,
        dm2: &DVector<f64>,
        wavelength: Wavelength,
    ) -> Result<DVector<Complex<f64>>> {
        self.bench.borrow().field(dm1, dm2, wavelength)
    }
    /// Mean dark zone contrast of the current DM commands
    pub fn contrast(&self, dark_zone: &DarkZone, wavelength: Wavelength) -> Result<f64> {
        let bench = self.bench.borrow();
        let field = bench.field(&bench.dm.dm1, &bench.dm.dm2, wavelength)?;
        let background = bench.incoherent_background;
        Ok(dark_zone.mean(&field.map(|e| e.norm_sqr() + background)))
    }
    /// Last command applied to the DMs
    pub fn dm_command(&self) -> DmCommand {
        self.bench.borrow().dm.clone()
    }
    pub fn fpm_position(&self) -> f64 {
        self.bench.borrow().fpm_position
    }
    pub fn nd_filter_position(&self) -> String {
        self.bench.borrow().filter.clone()
    }
    pub fn laser_current(&self) -> f64 {
        self.bench.borrow().laser_current
    }
    /// Number of camera captures so far
    pub fn captures(&self) -> usize {
        self.bench.borrow().captures
    }
    /// Number of simulated devices currently open
    pub fn open_devices(&self) -> usize {
        self.bench.borrow().open_devices
    }
    /// Simulated devices, the field oracle included
    pub fn devices(&self) -> DeviceContextBuilder {
        DeviceContext::builder(
            Box::new(SimCamera(self.clone())),
            Box::new(SimDm(self.clone())),
            Box::new(SimFpm(self.clone())),
        )
        .nd_wheel(Box::new(SimFilterWheel(self.clone())))
        .laser(Box::new(SimLaser(self.clone())), 600f64)
        .pupil_camera(Box::new(SimPupilCamera(self.clone())))
        .temperature_sensor(Box::new(SimTemperatureSensor(self.clone())))
        .oracle(Box::new(self.clone()))
    }
    fn opened(&self) -> Result<()> {
        self.bench.borrow_mut().open_devices += 1;
        Ok(())
    }
    fn closed(&self) -> Result<()> {
        let mut bench = self.bench.borrow_mut();
        bench.open_devices = bench.open_devices.saturating_sub(1);
        Ok(())
    }
}
impl FieldOracle for LinearTestbed {
    fn true_field(
        &mut self,
        dm1: &DVector<f64>,
        dm2: &DVector<f64>,
        wavelength: Wavelength,
    ) -> Result<DVector<Complex<f64>>> {
        self.field(dm1, dm2, wavelength)
    }
}

macro_rules! simulated_device {
    ($device:ident, $name:expr) => {
        struct $device(LinearTestbed);
        impl Device for $device {
            fn name(&self) -> &str {
                $name
            }
            fn open(&mut self) -> Result<()> {
                self.0.opened()
            }
            fn close(&mut self) -> Result<()> {
                self.0.closed()
            }
        }
    };
}
simulated_device!(SimCamera, "simulated camera");
simulated_device!(SimDm, "simulated DM controller");
simulated_device!(SimFpm, "simulated FPM stage");
simulated_device!(SimFilterWheel, "simulated ND filter wheel");
simulated_device!(SimLaser, "simulated laser");
simulated_device!(SimPupilCamera, "simulated pupil camera");
simulated_device!(SimTemperatureSensor, "simulated temperature sensor");

impl Camera for SimCamera {
    fn capture(&mut self, settings: &CaptureSettings) -> Result<DVector<f64>> {
        let mut bench = self.0.bench.borrow_mut();
        bench.captures += 1;
        if bench.camera_failure_after.map_or(false, |n| bench.captures > n) {
            return Err(Error::Device {
                device: self.name().into(),
                message: "frame readout timed out".into(),
            });
        }
        let scale = bench.direct_peak
            * bench.transmission()?
            * settings.exposure_time
            * 1e-6
            * settings.num_exposures as f64;
        let image = if (bench.fpm_position - bench.fpm.coron).abs() < 1e-9 {
            let field = bench.field(&bench.dm.dm1, &bench.dm.dm2, settings.wavelength)?;
            let background = bench.incoherent_background;
            field.map(|e| (e.norm_sqr() + background) * scale)
        } else if (bench.fpm_position - bench.fpm.direct).abs() < 1e-9 {
            let mut image = DVector::zeros(bench.grid.0 * bench.grid.1);
            image[bench.center()] = scale;
            image
        } else {
            return Err(Error::Device {
                device: self.name().into(),
                message: format!("FPM stage stuck at {}", bench.fpm_position),
            });
        };
        Ok(match bench.frame_pixels {
            Some(n) if n < image.len() => image.rows(0, n).into_owned(),
            _ => image,
        })
    }
}

impl DeformableMirror for SimDm {
    fn apply_shape(&mut self, command: &DmCommand) -> Result<()> {
        let mut bench = self.0.bench.borrow_mut();
        let n = bench.layout.len();
        for dm in [&command.dm1, &command.dm2] {
            if dm.len() != n {
                return Err(Error::dimension("DM command", n, dm.len()));
            }
        }
        bench.dm = command.clone();
        Ok(())
    }
}

impl MotorAxis for SimFpm {
    fn get_position(&mut self) -> Result<f64> {
        Ok(self.0.bench.borrow().fpm_position)
    }
    fn set_position(&mut self, position: f64) -> Result<()> {
        self.0.bench.borrow_mut().fpm_position = position;
        Ok(())
    }
}

impl FilterWheel for SimFilterWheel {
    fn get_position(&mut self) -> Result<String> {
        Ok(self.0.bench.borrow().filter.clone())
    }
    fn set_position(&mut self, filter: &str) -> Result<()> {
        let mut bench = self.0.bench.borrow_mut();
        if !bench.filters.iter().any(|(name, _)| name == filter) {
            return Err(Error::Device {
                device: self.name().into(),
                message: format!("unknown filter {filter}"),
            });
        }
        bench.filter = filter.to_string();
        Ok(())
    }
}

impl LaserSource for SimLaser {
    fn set_current(&mut self, current: f64) -> Result<()> {
        self.0.bench.borrow_mut().laser_current = current;
        Ok(())
    }
    fn get_current(&mut self) -> Result<f64> {
        Ok(self.0.bench.borrow().laser_current)
    }
}

impl TemperatureSensor for SimTemperatureSensor {
    fn get_temp_humidity(&mut self) -> Result<(f64, f64)> {
        if self.0.bench.borrow().failing_temperature_sensor {
            return Err(Error::Device {
                device: self.name().into(),
                message: "no reading".into(),
            });
        }
        Ok((21.5, 12.))
    }
}

impl PupilCamera for SimPupilCamera {
    fn capture(&mut self, _num_exposures: usize) -> Result<((usize, usize), Vec<f64>)> {
        let bench = self.0.bench.borrow();
        if bench.failing_pupil_camera {
            return Err(Error::Device {
                device: self.name().into(),
                message: "capture timed out".into(),
            });
        }
        let (rows, cols) = bench.layout.shape();
        Ok(((rows, cols), bench.layout.to_surface(&bench.dm.dm1)?))
    }
}

/// Deterministic Jacobian of sinusoidal actuator responses
///
/// `n_actuator` rows and the real and imaginary parts of `n_grid` pixels,
/// the response amplitude is `scale` per nm.
pub fn sinusoidal_jacobian(n_actuator: usize, n_grid: usize, scale: f64) -> Jacobian {
    Jacobian::new(DMatrix::from_fn(n_actuator, 2 * n_grid, |i, j| {
        let (k, phase) = if j < n_grid { (j, 0f64) } else { (j - n_grid, 0.5) };
        scale * (0.37 * (i * i) as f64 + 1.91 * (k as f64) * (1. + i as f64).sqrt() + phase).sin()
    }))
}

/// Probes with cosine actuator patterns of `amplitude` [nm] and their observation matrix
///
/// The observation matrix is calibrated with the field response of the `jacobian`.
pub fn calibrated_probes(
    jacobian: &Jacobian,
    layout: &ActuatorLayout,
    dark_zone: DarkZone,
    n_probe: usize,
    amplitude: f64,
) -> Result<ProbeSet> {
    let n = layout.len();
    let probes: Vec<DVector<f64>> = (0..n_probe)
        .map(|p| {
            DVector::from_fn(n, |i, _| {
                amplitude * (2.3 * (p + 1) as f64 * i as f64 / n as f64 + p as f64).cos()
            })
        })
        .collect();
    let probe_fields = probes
        .iter()
        .map(|probe| -> Result<DVector<Complex<f64>>> {
            let (p1, p2) = layout.split_command_vector(probe)?;
            let actuators =
                DVector::from_iterator(2 * n, p1.iter().chain(p2.iter()).cloned());
            Ok(dark_zone.select(&jacobian.field_response(&actuators)?) * Complex::new(2f64, 0f64))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ProbeSet::calibrate(probes, &probe_fields, dark_zone, 1e-6)?.with_probe_amplitude(amplitude))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Normed;
    use crate::exposure::{ExposureRequest, ExposureSettings, ExposureType, Exposer};

    #[test]
    fn devices_open_and_close() {
        let testbed = LinearTestbed::toy((2, 2), ActuatorLayout::full(2, 2), 640.);
        {
            let devices = testbed.devices().open().unwrap();
            assert_eq!(testbed.open_devices(), 7);
            assert!(devices.oracle.is_some());
            assert_eq!(testbed.laser_current(), 600.);
        }
        assert_eq!(testbed.open_devices(), 0);
    }

    #[test]
    fn linear_field() {
        let layout = ActuatorLayout::full(2, 2);
        let jacobian = sinusoidal_jacobian(8, 4, 1e-3);
        let aberration = DVector::from_element(4, Complex::new(1e-3, -1e-3));
        let testbed = LinearTestbed::new(
            (2, 2),
            layout,
            ByWavelength::single(Wavelength(640.), (jacobian.clone(), aberration.clone())),
        )
        .unwrap();
        let dm1 = DVector::from_vec(vec![1., 0., 0., 0.]);
        let dm2 = DVector::from_vec(vec![0., 0., 0., 2.]);
        let field = testbed.field(&dm1, &dm2, Wavelength(640.)).unwrap();
        let m = jacobian.matrix();
        let expected = Complex::new(1e-3 + m[(0, 1)] + 2. * m[(7, 1)], -1e-3 + m[(0, 5)] + 2. * m[(7, 5)]);
        assert!((field[1] - expected).norm() < 1e-15);
        assert!(testbed.field(&dm1, &dm2, Wavelength(700.)).is_err());
    }

    #[test]
    fn coronagraphic_image() {
        let layout = ActuatorLayout::full(1, 2);
        let aberration = DVector::from_vec(vec![
            Complex::new(0.01, 0.),
            Complex::new(0., 0.02),
            Complex::new(0., 0.),
            Complex::new(0., 0.),
        ]);
        let testbed = LinearTestbed::new(
            (2, 2),
            layout,
            ByWavelength::single(
                Wavelength(640.),
                (Jacobian::new(DMatrix::zeros(2, 8)), aberration),
            ),
        )
        .unwrap()
        .incoherent_background(1e-6);
        let mut devices = testbed.devices().open().unwrap();
        let mut exposer = Exposer::new(
            ExposureSettings {
                file_mode: false,
                ..Default::default()
            },
            (2, 2),
        );
        let dm = DVector::zeros(2);
        let path = std::env::temp_dir();
        let (direct, _) = exposer
            .take_exposure(
                &mut devices,
                &ExposureRequest::new(&dm, &dm, Wavelength(640.), ExposureType::Direct, &path),
            )
            .unwrap();
        let peak = direct.iter().cloned().fold(f64::MIN, f64::max);
        assert!((direct[3] - peak).abs() < 1e-9);
        let (coron, _) = exposer
            .take_exposure(
                &mut devices,
                &ExposureRequest::new(&dm, &dm, Wavelength(640.), ExposureType::Coron, &path),
            )
            .unwrap();
        let contrast = coron / peak;
        assert!((contrast[0] - (1e-4 + 1e-6)).abs() < 1e-15);
        assert!((contrast[1] - (4e-4 + 1e-6)).abs() < 1e-15);
        assert_eq!(testbed.captures(), 2);
    }

    #[test]
    fn failing_sensors() {
        let testbed = LinearTestbed::toy((2, 2), ActuatorLayout::full(1, 1), 640.)
            .failing_temperature_sensor()
            .failing_pupil_camera();
        let mut devices = testbed.devices().open().unwrap();
        assert!(devices.temp_humidity().is_none());
        assert!(devices
            .pupil_camera
            .as_mut()
            .map(|camera| camera.capture(1).is_err())
            .unwrap_or_default());
    }
}
