//! # Testbed devices
//!
//! Capability traits of the hardware the control loop drives and the
//! [DeviceContext] holding them open for the duration of an experiment.
//! Devices are opened when wrapped into a [Scoped] guard and closed when the guard is dropped.

use crate::{optics::Wavelength, Result};
use nalgebra::{Complex, DVector};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// A device that must be opened before use and closed after
pub trait Device {
    fn name(&self) -> &str;
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}
impl<D: Device + ?Sized> Device for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Camera capture settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub wavelength: Wavelength,
    /// Exposure time [μs]
    pub exposure_time: f64,
    pub num_exposures: usize,
}

/// Focal-plane science camera
pub trait Camera: Device {
    /// Sum of `num_exposures` frames [counts], row-major over the focal-plane grid
    fn capture(&mut self, settings: &CaptureSettings) -> Result<DVector<f64>>;
}

/// Commands of both DMs [nm]
#[derive(Debug, Clone, PartialEq)]
pub struct DmCommand {
    pub dm1: DVector<f64>,
    pub dm2: DVector<f64>,
}

/// DM controller driving DM1 and DM2
pub trait DeformableMirror: Device {
    fn apply_shape(&mut self, command: &DmCommand) -> Result<()>;
}

/// Motorized stage, e.g. the focal-plane mask (FPM) stage
pub trait MotorAxis: Device {
    fn get_position(&mut self) -> Result<f64>;
    fn set_position(&mut self, position: f64) -> Result<()>;
}

/// Neutral density filter wheel
pub trait FilterWheel: Device {
    fn get_position(&mut self) -> Result<String>;
    fn set_position(&mut self, filter: &str) -> Result<()>;
}

/// Laser source
pub trait LaserSource: Device {
    /// Sets the laser current [mA]
    fn set_current(&mut self, current: f64) -> Result<()>;
    fn get_current(&mut self) -> Result<f64>;
}

/// Enclosure temperature [C] and relative humidity [%] sensor
pub trait TemperatureSensor: Device {
    fn get_temp_humidity(&mut self) -> Result<(f64, f64)>;
}

/// Pupil imaging camera
pub trait PupilCamera: Device {
    /// Row-major image and its (rows,columns) shape
    fn capture(&mut self, num_exposures: usize) -> Result<((usize, usize), Vec<f64>)>;
}

/// Ground truth of a simulated testbed
pub trait FieldOracle {
    /// Focal-plane electric field, normalized to the square root of the direct image peak
    fn true_field(
        &mut self,
        dm1: &DVector<f64>,
        dm2: &DVector<f64>,
        wavelength: Wavelength,
    ) -> Result<DVector<Complex<f64>>>;
}

/// FPM stage positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FpmPositions {
    /// Position with the focal-plane mask in
    pub coron: f64,
    /// Position with the focal-plane mask out
    pub direct: f64,
}
impl Default for FpmPositions {
    fn default() -> Self {
        Self {
            coron: 0f64,
            direct: 10f64,
        }
    }
}

/// Keeps a device open while in scope
pub struct Scoped<D: Device> {
    device: D,
}
impl<D: Device> Scoped<D> {
    pub fn open(mut device: D) -> Result<Self> {
        device.open()?;
        log::debug!("{} opened", device.name());
        Ok(Self { device })
    }
}
impl<D: Device> Deref for Scoped<D> {
    type Target = D;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}
impl<D: Device> DerefMut for Scoped<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.device
    }
}
impl<D: Device> Drop for Scoped<D> {
    fn drop(&mut self) {
        match self.device.close() {
            Ok(()) => log::debug!("{} closed", self.device.name()),
            Err(e) => log::error!("failed to close {}: {}", self.device.name(), e),
        }
    }
}

/// Open testbed devices
pub struct DeviceContext {
    pub camera: Scoped<Box<dyn Camera>>,
    pub dm: Scoped<Box<dyn DeformableMirror>>,
    pub fpm: Scoped<Box<dyn MotorAxis>>,
    pub nd_wheel: Option<Scoped<Box<dyn FilterWheel>>>,
    pub laser: Option<Scoped<Box<dyn LaserSource>>>,
    pub pupil_camera: Option<Scoped<Box<dyn PupilCamera>>>,
    pub temperature_sensor: Option<Scoped<Box<dyn TemperatureSensor>>>,
    pub oracle: Option<Box<dyn FieldOracle>>,
}
impl DeviceContext {
    pub fn builder(
        camera: Box<dyn Camera>,
        dm: Box<dyn DeformableMirror>,
        fpm: Box<dyn MotorAxis>,
    ) -> DeviceContextBuilder {
        DeviceContextBuilder {
            camera,
            dm,
            fpm,
            nd_wheel: None,
            laser: None,
            pupil_camera: None,
            temperature_sensor: None,
            oracle: None,
        }
    }
    /// Enclosure temperature and humidity, `None` if unavailable
    pub fn temp_humidity(&mut self) -> Option<(f64, f64)> {
        let sensor = self.temperature_sensor.as_mut()?;
        match sensor.get_temp_humidity() {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Failed to read temperature and humidity: {}", e);
                None
            }
        }
    }
}

/// [DeviceContext] builder
pub struct DeviceContextBuilder {
    camera: Box<dyn Camera>,
    dm: Box<dyn DeformableMirror>,
    fpm: Box<dyn MotorAxis>,
    nd_wheel: Option<Box<dyn FilterWheel>>,
    laser: Option<(Box<dyn LaserSource>, f64)>,
    pupil_camera: Option<Box<dyn PupilCamera>>,
    temperature_sensor: Option<Box<dyn TemperatureSensor>>,
    oracle: Option<Box<dyn FieldOracle>>,
}
impl DeviceContextBuilder {
    pub fn nd_wheel(mut self, nd_wheel: Box<dyn FilterWheel>) -> Self {
        self.nd_wheel = Some(nd_wheel);
        self
    }
    /// Laser source and its operating current [mA]
    pub fn laser(mut self, laser: Box<dyn LaserSource>, current: f64) -> Self {
        self.laser = Some((laser, current));
        self
    }
    pub fn pupil_camera(mut self, camera: Box<dyn PupilCamera>) -> Self {
        self.pupil_camera = Some(camera);
        self
    }
    pub fn temperature_sensor(mut self, sensor: Box<dyn TemperatureSensor>) -> Self {
        self.temperature_sensor = Some(sensor);
        self
    }
    pub fn oracle(mut self, oracle: Box<dyn FieldOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }
    /// Opens all the devices, those already opened are closed if one fails
    pub fn open(self) -> Result<DeviceContext> {
        let laser = match self.laser {
            Some((laser, current)) => {
                let mut laser = Scoped::open(laser)?;
                laser.set_current(current)?;
                let name = laser.name().to_string();
                log::info!("{} current set to {}mA", name, laser.get_current()?);
                Some(laser)
            }
            None => None,
        };
        let dm = Scoped::open(self.dm)?;
        let fpm = Scoped::open(self.fpm)?;
        let nd_wheel = self.nd_wheel.map(Scoped::open).transpose()?;
        let camera = Scoped::open(self.camera)?;
        let pupil_camera = self.pupil_camera.map(Scoped::open).transpose()?;
        let temperature_sensor = self.temperature_sensor.map(Scoped::open).transpose()?;
        Ok(DeviceContext {
            camera,
            dm,
            fpm,
            nd_wheel,
            laser,
            pupil_camera,
            temperature_sensor,
            oracle: self.oracle,
        })
    }
}
