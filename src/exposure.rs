//! # Exposures
//!
//! Sets up the testbed for a coronagraphic or direct exposure, takes it and
//! calibrates it into count rates.

use crate::{
    devices::{CaptureSettings, DeviceContext, DmCommand, FpmPositions},
    fits::{Hdu, HduList, Header},
    optics::{DarkZone, Wavelength},
    Error, Result,
};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

/// Exposure type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureType {
    /// Focal-plane mask in
    Coron,
    /// Focal-plane mask out
    Direct,
}
impl fmt::Display for ExposureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureType::Coron => write!(f, "coron"),
            ExposureType::Direct => write!(f, "direct"),
        }
    }
}

/// Camera and file settings of the exposures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSettings {
    /// Number of frames co-added per exposure
    pub num_exposures: usize,
    /// Coronagraphic exposure time [μs]
    pub exposure_time_coron: f64,
    /// Direct exposure time [μs]
    pub exposure_time_direct: f64,
    /// Write the exposures to FITS files
    pub file_mode: bool,
    /// Number of exposures whose raw frames are skipped between two saved ones
    pub raw_skip: usize,
    pub fpm: FpmPositions,
}
impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            num_exposures: 10,
            exposure_time_coron: 100_000f64,
            exposure_time_direct: 100f64,
            file_mode: true,
            raw_skip: 0,
            fpm: FpmPositions::default(),
        }
    }
}

/// An exposure request
#[derive(Debug, Clone)]
pub struct ExposureRequest<'a> {
    /// DM1 command [nm]
    pub dm1: &'a DVector<f64>,
    /// DM2 command [nm]
    pub dm2: &'a DVector<f64>,
    pub wavelength: Wavelength,
    pub exposure_type: ExposureType,
    /// Directory the exposure files are written to
    pub path: &'a Path,
    pub suffix: Option<&'a str>,
    pub nd_filter: Option<&'a str>,
    /// Factor the count rates are multiplied by to undo the ND filter attenuation
    pub flux_attenuation_factor: f64,
    /// Dark zone the `SNR_DZ` header keyword is computed over
    pub dark_zone: Option<&'a DarkZone>,
    /// Exposure time [μs], the default of the exposure type if `None`
    pub exposure_time: Option<f64>,
}
impl<'a> ExposureRequest<'a> {
    pub fn new(
        dm1: &'a DVector<f64>,
        dm2: &'a DVector<f64>,
        wavelength: Wavelength,
        exposure_type: ExposureType,
        path: &'a Path,
    ) -> Self {
        Self {
            dm1,
            dm2,
            wavelength,
            exposure_type,
            path,
            suffix: None,
            nd_filter: None,
            flux_attenuation_factor: 1f64,
            dark_zone: None,
            exposure_time: None,
        }
    }
    pub fn suffix(self, suffix: &'a str) -> Self {
        Self {
            suffix: Some(suffix),
            ..self
        }
    }
    pub fn nd_filter(self, nd_filter: Option<&'a str>) -> Self {
        Self { nd_filter, ..self }
    }
    pub fn flux_attenuation_factor(self, factor: f64) -> Self {
        Self {
            flux_attenuation_factor: factor,
            ..self
        }
    }
    pub fn dark_zone(self, dark_zone: &'a DarkZone) -> Self {
        Self {
            dark_zone: Some(dark_zone),
            ..self
        }
    }
}

/// Signal to noise ratio of the dark zone, the square root of the mean counts
pub fn dark_zone_snr(raw: &DVector<f64>, dark_zone: &DarkZone) -> f64 {
    let mean = dark_zone.mean(raw);
    if mean > 0f64 {
        mean.sqrt()
    } else {
        f64::NAN
    }
}

/// Peak of a direct image, it must be positive to normalize coronagraphic images
pub fn image_peak(image: &DVector<f64>) -> Result<f64> {
    let peak = image.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if peak > 0f64 && peak.is_finite() {
        Ok(peak)
    } else {
        Err(Error::Parameter {
            name: "direct image peak",
            value: peak,
        })
    }
}

/// Takes and calibrates exposures
#[derive(Debug, Clone)]
pub struct Exposer {
    settings: ExposureSettings,
    grid: (usize, usize),
    counter: usize,
}
impl Exposer {
    /// Creates an exposer for images over a focal-plane `grid` of (rows,columns)
    pub fn new(settings: ExposureSettings, grid: (usize, usize)) -> Self {
        Self {
            settings,
            grid,
            counter: 0,
        }
    }
    pub fn settings(&self) -> &ExposureSettings {
        &self.settings
    }
    pub fn num_exposures(&self) -> usize {
        self.settings.num_exposures
    }
    pub fn set_num_exposures(&mut self, num_exposures: usize) {
        self.settings.num_exposures = num_exposures;
    }
    /// Number of exposures taken so far
    pub fn count(&self) -> usize {
        self.counter
    }
    /// Takes an exposure
    ///
    /// The DMs, the FPM stage and the ND filter wheel are set first, then the
    /// camera frames are co-added and converted to count rates [counts/s] times
    /// the flux attenuation factor. The calibrated image is returned with its header.
    pub fn take_exposure(
        &mut self,
        devices: &mut DeviceContext,
        request: &ExposureRequest<'_>,
    ) -> Result<(DVector<f64>, Header)> {
        devices.dm.apply_shape(&DmCommand {
            dm1: request.dm1.clone(),
            dm2: request.dm2.clone(),
        })?;

        let position = match request.exposure_type {
            ExposureType::Coron => self.settings.fpm.coron,
            ExposureType::Direct => self.settings.fpm.direct,
        };
        if (devices.fpm.get_position()? - position).abs() > 1e-9 {
            devices.fpm.set_position(position)?;
        }

        if let (Some(wheel), Some(filter)) = (devices.nd_wheel.as_mut(), request.nd_filter) {
            if wheel.get_position()? != filter {
                log::debug!("{}: moving to {}", wheel.name(), filter);
                wheel.set_position(filter)?;
            }
        }

        let exposure_time = request.exposure_time.unwrap_or(match request.exposure_type {
            ExposureType::Coron => self.settings.exposure_time_coron,
            ExposureType::Direct => self.settings.exposure_time_direct,
        });
        let num_exposures = self.settings.num_exposures.max(1);
        let raw = devices.camera.capture(&CaptureSettings {
            wavelength: request.wavelength,
            exposure_time,
            num_exposures,
        })?;
        let n_pixel = self.grid.0 * self.grid.1;
        if raw.len() != n_pixel {
            return Err(Error::dimension("camera frame pixels", n_pixel, raw.len()));
        }
        let rate = request.flux_attenuation_factor / (exposure_time * 1e-6 * num_exposures as f64);
        let calibrated = &raw * rate;

        let mut header = Header::new();
        header.set("EXP_TYPE", request.exposure_type.to_string());
        header.set("EXP_TIME", exposure_time);
        header.set("NUM_EXP", num_exposures);
        header.set("WAVELEN", request.wavelength.nm());
        header.set("ND_FILT", request.nd_filter.unwrap_or("none"));
        header.set("ATTENFAC", request.flux_attenuation_factor);
        if let Some(dark_zone) = request.dark_zone {
            let snr = dark_zone_snr(&raw, dark_zone);
            header.set("SNR_DZ", if snr.is_finite() { snr } else { 0f64 });
        }

        if self.settings.file_mode {
            self.write(request, &raw, &calibrated, &header)?;
        }
        self.counter += 1;
        Ok((calibrated, header))
    }
    fn write(
        &self,
        request: &ExposureRequest<'_>,
        raw: &DVector<f64>,
        calibrated: &DVector<f64>,
        header: &Header,
    ) -> Result<()> {
        fs::create_dir_all(request.path)?;
        let name = match request.suffix {
            Some(suffix) => format!(
                "{}_{:.0}nm_{}",
                request.exposure_type,
                request.wavelength.nm(),
                suffix
            ),
            None => format!("{}_{:.0}nm", request.exposure_type, request.wavelength.nm()),
        };
        let shape = vec![self.grid.0, self.grid.1];
        let hdu = |data: &DVector<f64>| -> Result<Hdu> {
            let mut hdu = Hdu::new(shape.clone(), data.as_slice().to_vec())?;
            header.iter().for_each(|(key, value)| hdu.header.set(key, value.clone()));
            Ok(hdu)
        };
        let save_raw = self
            .settings
            .raw_skip
            .checked_add(1)
            .map_or(false, |period| self.counter % period == 0);
        if save_raw {
            HduList::new(hdu(raw)?).write(request.path.join(format!("{name}.fits")))?;
        }
        HduList::new(hdu(calibrated)?).write(request.path.join(format!("{name}_cal.fits")))?;
        Ok(())
    }
}
