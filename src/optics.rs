//! # Optical model
//!
//! Focal-plane dark zone, DM actuator layout, wavelength-keyed channels and
//! the DM-to-field Jacobian.

use crate::{
    fits::{FitsReader, Hdu, HduList},
    Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector, Scalar};
use std::{
    fmt,
    ops::{Add, Div, Mul},
    path::Path,
};

/// Focal-plane pixels where the coronagraphic contrast is controlled
#[derive(Debug, Clone, PartialEq)]
pub struct DarkZone {
    grid: (usize, usize),
    mask: Vec<bool>,
    pixels: Vec<usize>,
}
impl DarkZone {
    /// Creates a dark zone from a row-major boolean `mask` over a `grid` of (rows,columns)
    pub fn new(grid: (usize, usize), mask: Vec<bool>) -> Result<Self> {
        if mask.len() != grid.0 * grid.1 {
            return Err(Error::dimension(
                "dark zone mask",
                grid.0 * grid.1,
                mask.len(),
            ));
        }
        let pixels = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect();
        Ok(Self { grid, mask, pixels })
    }
    /// Creates a dark zone from a 2D image HDU, non-zero pixels are inside
    pub fn from_hdu(hdu: &Hdu) -> Result<Self> {
        match *hdu.shape() {
            [rows, cols] => Self::new(
                (rows, cols),
                hdu.data().iter().map(|&x| x != 0f64).collect(),
            ),
            ref shape => Err(Error::dimension("dark zone rank", 2, shape.len())),
        }
    }
    /// Focal-plane grid (rows,columns)
    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }
    /// Number of focal-plane pixels
    pub fn grid_size(&self) -> usize {
        self.mask.len()
    }
    /// Number of pixels inside the dark zone
    pub fn len(&self) -> usize {
        self.pixels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }
    /// Row-major indices of the dark zone pixels
    pub fn pixels(&self) -> &[usize] {
        &self.pixels
    }
    /// Restricts a focal-plane image to the dark zone pixels
    pub fn select<T: Scalar + Copy>(&self, image: &DVector<T>) -> DVector<T> {
        DVector::from_iterator(self.len(), self.pixels.iter().map(|&i| image[i]))
    }
    /// Mean of a focal-plane image over the dark zone
    pub fn mean(&self, image: &DVector<f64>) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.pixels.iter().map(|&i| image[i]).sum::<f64>() / self.len() as f64
    }
    /// Places dark zone values back onto the focal-plane grid, `fill` elsewhere
    pub fn scatter<T: Scalar + Copy>(&self, values: &DVector<T>, fill: T) -> DVector<T> {
        let mut grid = DVector::from_element(self.grid_size(), fill);
        self.pixels
            .iter()
            .zip(values.iter())
            .for_each(|(&i, &v)| grid[i] = v);
        grid
    }
}

/// Mean intensity of a complex field
pub fn mean_intensity(field: &DVector<Complex<f64>>) -> f64 {
    if field.is_empty() {
        return f64::NAN;
    }
    field.iter().map(|e| e.norm_sqr()).sum::<f64>() / field.len() as f64
}

/// Active actuators of a DM square grid
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorLayout {
    shape: (usize, usize),
    active: Vec<usize>,
}
impl ActuatorLayout {
    /// All the actuators of a `rows`x`cols` grid
    pub fn full(rows: usize, cols: usize) -> Self {
        Self {
            shape: (rows, cols),
            active: (0..rows * cols).collect(),
        }
    }
    /// Actuators where the row-major `mask` is true
    pub fn from_mask(shape: (usize, usize), mask: &[bool]) -> Result<Self> {
        if mask.len() != shape.0 * shape.1 {
            return Err(Error::dimension(
                "actuator mask",
                shape.0 * shape.1,
                mask.len(),
            ));
        }
        Ok(Self {
            shape,
            active: mask
                .iter()
                .enumerate()
                .filter_map(|(i, &m)| m.then_some(i))
                .collect(),
        })
    }
    /// Loads the actuator mask from the primary HDU of a FITS file
    pub fn from_fits<P: AsRef<Path>>(path: P) -> Result<Self> {
        let hdu = FitsReader::open(path)?.primary()?;
        match *hdu.shape() {
            [rows, cols] => Self::from_mask(
                (rows, cols),
                &hdu.data().iter().map(|&x| x != 0f64).collect::<Vec<_>>(),
            ),
            ref shape => Err(Error::dimension("actuator mask rank", 2, shape.len())),
        }
    }
    /// Number of active actuators per DM
    pub fn len(&self) -> usize {
        self.active.len()
    }
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }
    /// Maps active actuator values onto the row-major 2D grid, inactive actuators are zero
    pub fn to_surface(&self, actuators: &DVector<f64>) -> Result<Vec<f64>> {
        if actuators.len() != self.len() {
            return Err(Error::dimension(
                "DM actuators",
                self.len(),
                actuators.len(),
            ));
        }
        let mut surface = vec![0f64; self.shape.0 * self.shape.1];
        self.active
            .iter()
            .zip(actuators.iter())
            .for_each(|(&i, &a)| surface[i] = a);
        Ok(surface)
    }
    /// Extracts the active actuator values from a row-major 2D grid
    pub fn from_surface(&self, surface: &[f64]) -> Result<DVector<f64>> {
        let n = self.shape.0 * self.shape.1;
        if surface.len() != n {
            return Err(Error::dimension("DM surface", n, surface.len()));
        }
        Ok(DVector::from_iterator(
            self.len(),
            self.active.iter().map(|&i| surface[i]),
        ))
    }
    /// Splits a command vector into DM1 and DM2 commands
    ///
    /// A vector of twice the number of actuators holds both DMs,
    /// a vector of the number of actuators is for DM1 and DM2 is left flat.
    pub fn split_command_vector(
        &self,
        command: &DVector<f64>,
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        let n = self.len();
        match command.len() {
            l if l == 2 * n => Ok((
                command.rows(0, n).into_owned(),
                command.rows(n, n).into_owned(),
            )),
            l if l == n => Ok((command.clone(), DVector::zeros(n))),
            l => Err(Error::dimension("DM command vector", 2 * n, l)),
        }
    }
}

/// Wavelength [nm]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Wavelength(pub f64);
impl Wavelength {
    pub fn nm(&self) -> f64 {
        self.0
    }
    pub fn meters(&self) -> f64 {
        self.0 * 1e-9
    }
}
impl fmt::Display for Wavelength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}nm", self.0)
    }
}

/// Per-wavelength values with a fixed, ordered set of wavelengths
#[derive(Debug, Clone, PartialEq)]
pub struct ByWavelength<T> {
    entries: Vec<(Wavelength, T)>,
}
impl<T> ByWavelength<T> {
    /// Builds the map, wavelengths must be unique and there must be at least one
    pub fn new<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Wavelength, T)>,
    {
        let mut map = Self { entries: vec![] };
        for (wavelength, value) in entries {
            if map.contains(wavelength) {
                return Err(Error::Parameter {
                    name: "duplicated wavelength",
                    value: wavelength.nm(),
                });
            }
            map.entries.push((wavelength, value));
        }
        if map.entries.is_empty() {
            return Err(Error::NoChannel);
        }
        Ok(map)
    }
    pub fn single(wavelength: Wavelength, value: T) -> Self {
        Self {
            entries: vec![(wavelength, value)],
        }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn contains(&self, wavelength: Wavelength) -> bool {
        self.entries.iter().any(|(w, _)| *w == wavelength)
    }
    pub fn wavelengths(&self) -> impl Iterator<Item = Wavelength> + '_ {
        self.entries.iter().map(|(w, _)| *w)
    }
    pub fn get(&self, wavelength: Wavelength) -> Result<&T> {
        self.entries
            .iter()
            .find(|(w, _)| *w == wavelength)
            .map(|(_, v)| v)
            .ok_or(Error::Wavelength(wavelength.nm()))
    }
    pub fn get_mut(&mut self, wavelength: Wavelength) -> Result<&mut T> {
        self.entries
            .iter_mut()
            .find(|(w, _)| *w == wavelength)
            .map(|(_, v)| v)
            .ok_or(Error::Wavelength(wavelength.nm()))
    }
    /// Replaces the value of an existing wavelength
    pub fn set(&mut self, wavelength: Wavelength, value: T) -> Result<()> {
        *self.get_mut(wavelength)? = value;
        Ok(())
    }
    pub fn iter(&self) -> impl Iterator<Item = (Wavelength, &T)> {
        self.entries.iter().map(|(w, v)| (*w, v))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Wavelength, &mut T)> {
        self.entries.iter_mut().map(|(w, v)| (*w, v))
    }
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }
    pub fn map<U, F>(&self, mut f: F) -> ByWavelength<U>
    where
        F: FnMut(Wavelength, &T) -> U,
    {
        ByWavelength {
            entries: self.iter().map(|(w, v)| (w, f(w, v))).collect(),
        }
    }
    pub fn try_map<U, F>(&self, mut f: F) -> Result<ByWavelength<U>>
    where
        F: FnMut(Wavelength, &T) -> Result<U>,
    {
        Ok(ByWavelength {
            entries: self
                .iter()
                .map(|(w, v)| f(w, v).map(|u| (w, u)))
                .collect::<Result<Vec<_>>>()?,
        })
    }
    /// Weighted mean of the values
    ///
    /// The weighted sum is divided by the number of wavelengths, not by the sum of the weights.
    pub fn weighted_mean(&self, weights: &ByWavelength<f64>) -> Result<T>
    where
        T: Clone + Mul<f64, Output = T> + Add<Output = T> + Div<f64, Output = T>,
    {
        let mut sum: Option<T> = None;
        for (wavelength, value) in self.iter() {
            let term = value.clone() * *weights.get(wavelength)?;
            sum = Some(match sum {
                Some(sum) => sum + term,
                None => term,
            });
        }
        sum.map(|sum| sum / self.len() as f64)
            .ok_or(Error::NoChannel)
    }
}

/// Linear response of the focal-plane electric field to the DM actuators
///
/// The matrix rows are the DM actuators (DM1 then DM2) and the columns are the
/// real parts of the field followed by the imaginary parts. The columns either
/// cover the whole focal-plane grid or only the dark zone pixels.
#[derive(Debug, Clone)]
pub struct Jacobian {
    matrix: DMatrix<f64>,
    dm_settings: Option<(DVector<f64>, DVector<f64>)>,
    coronagraph_mode: Option<String>,
}
impl Jacobian {
    pub fn new(matrix: DMatrix<f64>) -> Self {
        Self {
            matrix,
            dm_settings: None,
            coronagraph_mode: None,
        }
    }
    /// Sets the DM commands [nm] the Jacobian was computed around
    pub fn with_dm_settings(mut self, dm1: DVector<f64>, dm2: DVector<f64>) -> Self {
        self.dm_settings = Some((dm1, dm2));
        self
    }
    pub fn with_coronagraph_mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.coronagraph_mode = Some(mode.into());
        self
    }
    /// Loads a Jacobian FITS file
    ///
    /// The primary HDU is the (actuators)x(2 pixels) matrix, the optional
    /// `DM_SETTINGS` extension holds the (2)x(actuators) DM commands the Jacobian
    /// was computed around and the `CRN_MODE` primary header keyword the coronagraph mode.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading Jacobian from {:?}", path);
        Self::from_fits(path).map_err(|e| Error::Jacobian {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }
    fn from_fits(path: &Path) -> Result<Self> {
        let mut fits = FitsReader::open(path)?;
        let primary = fits.primary()?;
        let matrix = match *primary.shape() {
            [rows, cols] => DMatrix::from_row_slice(rows, cols, primary.data()),
            ref shape => return Err(Error::dimension("Jacobian rank", 2, shape.len())),
        };
        let coronagraph_mode = fits.key_str("CRN_MODE");
        let dm_settings = match fits.extension("DM_SETTINGS")? {
            Some(hdu) => match *hdu.shape() {
                [2, n] => Some((
                    DVector::from_column_slice(&hdu.data()[..n]),
                    DVector::from_column_slice(&hdu.data()[n..]),
                )),
                ref shape => {
                    return Err(Error::dimension(
                        "DM_SETTINGS leading axis",
                        2,
                        shape.first().copied().unwrap_or_default(),
                    ))
                }
            },
            None => None,
        };
        Ok(Self {
            matrix,
            dm_settings,
            coronagraph_mode,
        })
    }
    /// Writes the Jacobian to a FITS file readable by [Jacobian::load]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (rows, cols) = self.matrix.shape();
        let mut primary = Hdu::new(vec![rows, cols], self.matrix.transpose().as_slice().to_vec())?;
        if let Some(mode) = &self.coronagraph_mode {
            primary.header.set("CRN_MODE", mode.as_str());
        }
        let mut hdus = HduList::new(primary);
        if let Some((dm1, dm2)) = &self.dm_settings {
            let data: Vec<f64> = dm1.iter().chain(dm2.iter()).cloned().collect();
            hdus.push(Hdu::new(vec![2, dm1.len()], data)?.named("DM_SETTINGS"));
        }
        Ok(hdus.write(path)?)
    }
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
    /// Number of actuator rows
    pub fn n_actuator(&self) -> usize {
        self.matrix.nrows()
    }
    pub fn dm_settings(&self) -> Option<&(DVector<f64>, DVector<f64>)> {
        self.dm_settings.as_ref()
    }
    pub fn coronagraph_mode(&self) -> Option<&str> {
        self.coronagraph_mode.as_deref()
    }
    /// Keeps only the first `n_actuator` rows (DM1)
    pub fn truncate(mut self, n_actuator: usize) -> Result<Self> {
        if n_actuator > self.matrix.nrows() {
            return Err(Error::dimension(
                "Jacobian rows",
                n_actuator,
                self.matrix.nrows(),
            ));
        }
        self.matrix = self.matrix.rows(0, n_actuator).into_owned();
        Ok(self)
    }
    /// Jacobian restricted to the dark zone, real parts columns then imaginary parts
    pub fn dark_zone_response(&self, dark_zone: &DarkZone) -> Result<DMatrix<f64>> {
        let n_grid = dark_zone.grid_size();
        match self.matrix.ncols() {
            n if n == 2 * n_grid => {
                let columns: Vec<usize> = dark_zone
                    .pixels()
                    .iter()
                    .cloned()
                    .chain(dark_zone.pixels().iter().map(|&i| i + n_grid))
                    .collect();
                Ok(self.matrix.select_columns(columns.iter()))
            }
            n if n == 2 * dark_zone.len() => Ok(self.matrix.clone()),
            n => Err(Error::dimension(
                "Jacobian columns",
                2 * dark_zone.len(),
                n,
            )),
        }
    }
    /// Change of the electric field for the DM `actuators` (DM1 then DM2) [nm]
    ///
    /// Only the Jacobian rows are used, extra actuators are ignored.
    pub fn field_response(&self, actuators: &DVector<f64>) -> Result<DVector<Complex<f64>>> {
        let n = self.matrix.nrows();
        if actuators.len() < n {
            return Err(Error::dimension("DM actuators", n, actuators.len()));
        }
        let delta = self.matrix.tr_mul(&actuators.rows(0, n));
        let half = self.matrix.ncols() / 2;
        Ok(DVector::from_fn(half, |i, _| {
            Complex::new(delta[i], delta[i + half])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_mean_divides_by_count() {
        let values = ByWavelength::new([
            (Wavelength(620.), DVector::from_vec(vec![1., 2.])),
            (Wavelength(640.), DVector::from_vec(vec![3., 4.])),
            (Wavelength(660.), DVector::from_vec(vec![5., 6.])),
        ])
        .unwrap();
        let weights =
            ByWavelength::new([(Wavelength(620.), 1.), (Wavelength(640.), 2.), (Wavelength(660.), 0.)])
                .unwrap();
        let mean = values.weighted_mean(&weights).unwrap();
        assert_eq!(mean, DVector::from_vec(vec![7. / 3., 10. / 3.]));
    }

    #[test]
    fn weighted_mean_unknown_wavelength() {
        let values = ByWavelength::single(Wavelength(640.), 1f64);
        let weights = ByWavelength::single(Wavelength(660.), 1f64);
        assert!(matches!(
            values.weighted_mean(&weights),
            Err(Error::Wavelength(w)) if w == 640.
        ));
    }

    #[test]
    fn duplicated_wavelengths() {
        assert!(ByWavelength::new([(Wavelength(640.), 1), (Wavelength(640.), 2)]).is_err());
        assert!(matches!(
            ByWavelength::<f64>::new([]),
            Err(Error::NoChannel)
        ));
    }

    #[test]
    fn split_command() {
        let layout = ActuatorLayout::full(2, 2);
        let both = DVector::from_iterator(8, (0..8).map(|x| x as f64));
        let (dm1, dm2) = layout.split_command_vector(&both).unwrap();
        assert_eq!(dm1.as_slice(), &[0., 1., 2., 3.]);
        assert_eq!(dm2.as_slice(), &[4., 5., 6., 7.]);
        let (dm1, dm2) = layout.split_command_vector(&dm1).unwrap();
        assert_eq!(dm1.as_slice(), &[0., 1., 2., 3.]);
        assert_eq!(dm2, DVector::zeros(4));
        assert!(layout
            .split_command_vector(&DVector::zeros(5))
            .is_err());
    }

    #[test]
    fn surface_mapping() {
        let layout =
            ActuatorLayout::from_mask((2, 3), &[false, true, true, true, true, false]).unwrap();
        assert_eq!(layout.len(), 4);
        let actuators = DVector::from_vec(vec![1., 2., 3., 4.]);
        let surface = layout.to_surface(&actuators).unwrap();
        assert_eq!(surface, vec![0., 1., 2., 3., 4., 0.]);
        assert_eq!(layout.from_surface(&surface).unwrap(), actuators);
    }

    #[test]
    fn dark_zone_columns() {
        let dark_zone = DarkZone::new((2, 2), vec![false, true, false, true]).unwrap();
        let matrix = DMatrix::from_fn(3, 8, |i, j| (10 * i + j) as f64);
        let jacobian = Jacobian::new(matrix);
        let m = jacobian.dark_zone_response(&dark_zone).unwrap();
        assert_eq!(m.shape(), (3, 4));
        assert_eq!(m.row(1).iter().cloned().collect::<Vec<_>>(), vec![11., 13., 15., 17.]);
        let restricted = Jacobian::new(m.clone());
        assert_eq!(restricted.dark_zone_response(&dark_zone).unwrap(), m);
        assert!(Jacobian::new(DMatrix::zeros(3, 6))
            .dark_zone_response(&dark_zone)
            .is_err());
    }

    #[test]
    fn dark_zone_statistics() {
        let dark_zone = DarkZone::new((1, 4), vec![true, false, true, false]).unwrap();
        let image = DVector::from_vec(vec![1., 100., 3., 100.]);
        assert_eq!(dark_zone.mean(&image), 2.);
        let field = DVector::from_vec(vec![Complex::new(1., 0.), Complex::new(0., 2.)]);
        let grid = dark_zone.scatter(&field, Complex::new(0., 0.));
        assert_eq!(grid[2], Complex::new(0., 2.));
        assert_eq!(grid[1], Complex::new(0., 0.));
        assert_eq!(mean_intensity(&field), 2.5);
    }
}
