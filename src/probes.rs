//! # Pairwise probes
//!
//! DM probe commands and the observation matrix that maps probe intensity
//! differences to the dark zone electric field.

use crate::{
    fits::{FitsReader, Hdu, HduList},
    optics::DarkZone,
    Error, Result,
};
use nalgebra::{Complex, DMatrix, DVector};
use std::path::{Path, PathBuf};

/// Probe commands and observation matrix
#[derive(Debug, Clone)]
pub struct ProbeSet {
    probes: Vec<DVector<f64>>,
    // (dark zone pixels)x(probes) real and imaginary rows of the observation matrix
    observation_real: DMatrix<f64>,
    observation_imag: DMatrix<f64>,
    dark_zone: DarkZone,
    dark_zone_probe: DarkZone,
    probe_amplitude: Option<f64>,
    dark_zone_radii: Option<(f64, f64)>,
    path: Option<PathBuf>,
}
impl ProbeSet {
    /// Creates a probe set from its probes [nm] and observation matrix
    ///
    /// `observation_real` and `observation_imag` are (dark zone pixels)x(probes)
    pub fn new(
        probes: Vec<DVector<f64>>,
        observation_real: DMatrix<f64>,
        observation_imag: DMatrix<f64>,
        dark_zone: DarkZone,
    ) -> Result<Self> {
        let shape = (dark_zone.len(), probes.len());
        for observation in [&observation_real, &observation_imag] {
            if observation.nrows() != shape.0 {
                return Err(Error::dimension(
                    "observation matrix pixels",
                    shape.0,
                    observation.nrows(),
                ));
            }
            if observation.ncols() != shape.1 {
                return Err(Error::dimension(
                    "observation matrix probes",
                    shape.1,
                    observation.ncols(),
                ));
            }
        }
        Ok(Self {
            probes,
            observation_real,
            observation_imag,
            dark_zone_probe: dark_zone.clone(),
            dark_zone,
            probe_amplitude: None,
            dark_zone_radii: None,
            path: None,
        })
    }
    /// Calibrates the observation matrix from the field changes of the probes
    ///
    /// `probe_fields` are the dark zone field differences `E(+probe) - E(-probe)`.
    /// For each pixel, the observation matrix is the pseudo-inverse of the
    /// (probes)x(2) matrix `2[Re ΔE, Im ΔE]` with singular values below
    /// `rcond` times the largest one discarded.
    pub fn calibrate(
        probes: Vec<DVector<f64>>,
        probe_fields: &[DVector<Complex<f64>>],
        dark_zone: DarkZone,
        rcond: f64,
    ) -> Result<Self> {
        if probe_fields.len() != probes.len() {
            return Err(Error::dimension(
                "probe fields",
                probes.len(),
                probe_fields.len(),
            ));
        }
        let n_probe = probes.len();
        let n_pixel = dark_zone.len();
        if let Some(field) = probe_fields.iter().find(|f| f.len() != n_pixel) {
            return Err(Error::dimension("probe field pixels", n_pixel, field.len()));
        }
        let mut observation_real = DMatrix::zeros(n_pixel, n_probe);
        let mut observation_imag = DMatrix::zeros(n_pixel, n_probe);
        for k in 0..n_pixel {
            let h = DMatrix::from_fn(n_probe, 2, |p, j| {
                let delta = probe_fields[p][k];
                2f64 * if j == 0 { delta.re } else { delta.im }
            });
            let s_max = h.singular_values().iter().fold(0f64, |a, &s| a.max(s));
            let h_inv = h
                .pseudo_inverse(rcond * s_max)
                .map_err(|_| Error::Parameter {
                    name: "observation matrix conditioning",
                    value: rcond,
                })?;
            observation_real.row_mut(k).copy_from(&h_inv.row(0));
            observation_imag.row_mut(k).copy_from(&h_inv.row(1));
        }
        Self::new(probes, observation_real, observation_imag, dark_zone)
    }
    /// Sets the probe amplitude [nm]
    pub fn with_probe_amplitude(mut self, amplitude: f64) -> Self {
        self.probe_amplitude = Some(amplitude);
        self
    }
    /// Sets the dark zone used when the probes were computed
    pub fn with_probe_dark_zone(mut self, dark_zone: DarkZone) -> Self {
        self.dark_zone_probe = dark_zone;
        self
    }
    /// Loads a probe FITS file
    ///
    /// The file holds the (probes)x(actuators) probe commands [nm] in the `PROBES`
    /// extension, the `OBS_MATRIX` (2)x(probes)x(dark zone pixels) extension, the
    /// `DARK_ZONE` mask and optionally the `DARK_ZONE_PROBE` mask. The data-less
    /// primary HDU header may give the probe amplitude (`PROBEAMP`) and the dark
    /// zone radii (`DZ_RIN`, `DZ_ROUT`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading probes from {:?}", path);
        Self::from_fits(path).map_err(|e| Error::Probes {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }
    fn from_fits(path: &Path) -> Result<Self> {
        let mut fits = FitsReader::open(path)?;
        let extension = |fits: &mut FitsReader, name: &str| -> Result<Hdu> {
            fits.extension(name)?
                .ok_or_else(|| Error::MissingExtension(name.into()))
        };
        let hdu = extension(&mut fits, "PROBES")?;
        let probes: Vec<DVector<f64>> = match *hdu.shape() {
            [n_probe, n_actuator] => (0..n_probe)
                .map(|p| {
                    DVector::from_column_slice(&hdu.data()[p * n_actuator..(p + 1) * n_actuator])
                })
                .collect(),
            ref shape => return Err(Error::dimension("probes rank", 2, shape.len())),
        };
        let dark_zone = DarkZone::from_hdu(&extension(&mut fits, "DARK_ZONE")?)?;
        let observation = extension(&mut fits, "OBS_MATRIX")?;
        let (observation_real, observation_imag) = match *observation.shape() {
            [2, n_probe, n_pixel] => {
                let data = observation.data();
                let part = |offset: usize| {
                    DMatrix::from_fn(n_pixel, n_probe, |k, p| data[offset + p * n_pixel + k])
                };
                (part(0), part(n_probe * n_pixel))
            }
            ref shape => {
                return Err(Error::dimension(
                    "OBS_MATRIX leading axis",
                    2,
                    shape.first().copied().unwrap_or_default(),
                ))
            }
        };
        let mut probe_set = Self::new(probes, observation_real, observation_imag, dark_zone)?;
        if let Some(hdu) = fits.extension("DARK_ZONE_PROBE")? {
            probe_set.dark_zone_probe = DarkZone::from_hdu(&hdu)?;
        }
        probe_set.probe_amplitude = fits.key_f64("PROBEAMP");
        probe_set.dark_zone_radii = fits.key_f64("DZ_RIN").zip(fits.key_f64("DZ_ROUT"));
        probe_set.path = Some(path.to_path_buf());
        Ok(probe_set)
    }
    /// Writes the probe set to a FITS file readable by [ProbeSet::load]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let n_actuator = self.probes.first().map_or(0, |p| p.len());
        let probes = Hdu::new(
            vec![self.probes.len(), n_actuator],
            self.probes.iter().flat_map(|p| p.iter().cloned()).collect(),
        )?;
        let mut primary = Hdu::empty();
        if let Some(amplitude) = self.probe_amplitude {
            primary.header.set("PROBEAMP", amplitude);
        }
        if let Some((r_in, r_out)) = self.dark_zone_radii {
            primary.header.set("DZ_RIN", r_in);
            primary.header.set("DZ_ROUT", r_out);
        }
        let mask = |dark_zone: &DarkZone| -> Result<Hdu> {
            let (rows, cols) = dark_zone.grid();
            Ok(Hdu::new(
                vec![rows, cols],
                dark_zone
                    .mask()
                    .iter()
                    .map(|&m| if m { 1f64 } else { 0f64 })
                    .collect(),
            )?)
        };
        // row-major (2,probes,pixels) is the transpose of the (pixels,probes) column-major storage
        let observation: Vec<f64> = self
            .observation_real
            .iter()
            .chain(self.observation_imag.iter())
            .cloned()
            .collect();
        HduList::new(primary)
            .with(probes.named("PROBES"))
            .with(Hdu::new(vec![2, self.len(), self.dark_zone.len()], observation)?.named("OBS_MATRIX"))
            .with(mask(&self.dark_zone)?.named("DARK_ZONE"))
            .with(mask(&self.dark_zone_probe)?.named("DARK_ZONE_PROBE"))
            .write(path)?;
        Ok(())
    }
    /// Number of probes
    pub fn len(&self) -> usize {
        self.probes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
    pub fn probes(&self) -> &[DVector<f64>] {
        &self.probes
    }
    pub fn dark_zone(&self) -> &DarkZone {
        &self.dark_zone
    }
    pub fn dark_zone_probe(&self) -> &DarkZone {
        &self.dark_zone_probe
    }
    /// Probe amplitude [nm]
    pub fn probe_amplitude(&self) -> Option<f64> {
        self.probe_amplitude
    }
    /// The file the probes were loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    /// Electric field from the (dark zone pixels)x(probes) intensity differences
    ///
    /// The observation matrix is divided by `scale`, the factor the probes were scaled with.
    pub fn observe(&self, delta_intensity: &DMatrix<f64>, scale: f64) -> DVector<Complex<f64>> {
        let real = self.observation_real.component_mul(delta_intensity).column_sum() / scale;
        let imag = self.observation_imag.component_mul(delta_intensity).column_sum() / scale;
        DVector::from_fn(real.len(), |k, _| Complex::new(real[k], imag[k]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Normed;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strokemin-probes-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn probe_set() -> ProbeSet {
        let dark_zone = DarkZone::new((2, 2), vec![true, false, true, true]).unwrap();
        let probes = vec![
            DVector::from_vec(vec![1., 0., 0.]),
            DVector::from_vec(vec![0., 1., 0.]),
        ];
        let real = DMatrix::from_row_slice(3, 2, &[1., 2., 3., 4., 5., 6.]);
        let imag = DMatrix::from_row_slice(3, 2, &[-1., -2., -3., -4., -5., -6.]);
        ProbeSet::new(probes, real, imag, dark_zone)
            .unwrap()
            .with_probe_amplitude(10.)
    }

    #[test]
    fn observation_sum() {
        let probe_set = probe_set();
        let delta = DMatrix::from_row_slice(3, 2, &[1., 1., 0., 1., 2., 0.]);
        let field = probe_set.observe(&delta, 2.);
        assert_eq!(field[0], Complex::new(1.5, -1.5));
        assert_eq!(field[1], Complex::new(2., -2.));
        assert_eq!(field[2], Complex::new(5., -5.));
    }

    #[test]
    fn fits_file() {
        let path = scratch("probes.fits");
        let probe_set = probe_set();
        probe_set.save(&path).unwrap();
        let loaded = ProbeSet::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.probe_amplitude(), Some(10.));
        assert_eq!(loaded.dark_zone(), probe_set.dark_zone());
        let delta = DMatrix::from_row_slice(3, 2, &[1., 1., 0., 1., 2., 0.]);
        assert_eq!(loaded.observe(&delta, 1.), probe_set.observe(&delta, 1.));
        assert_eq!(loaded.path(), Some(path.as_path()));
    }

    #[test]
    fn hicat_layout() {
        let path = scratch("hicat.fits");
        let mut primary = Hdu::empty();
        primary.header.set("PROBEAMP", 20i64);
        primary.header.set("DZ_RIN", 6.);
        primary.header.set("DZ_ROUT", 11.);
        let observation: Vec<f64> = (0..12).map(|x| x as f64).collect();
        HduList::new(primary)
            .with(
                Hdu::new(vec![2, 3], vec![1., 0., 0., 0., 1., 0.])
                    .unwrap()
                    .named("PROBES"),
            )
            .with(
                Hdu::new(vec![2, 2, 3], observation)
                    .unwrap()
                    .named("OBS_MATRIX"),
            )
            .with(
                Hdu::new(vec![2, 2], vec![1., 0., 1., 1.])
                    .unwrap()
                    .named("DARK_ZONE"),
            )
            .write(&path)
            .unwrap();

        let probe_set = ProbeSet::load(&path).unwrap();
        assert_eq!(probe_set.len(), 2);
        assert_eq!(probe_set.probes()[1].as_slice(), &[0., 1., 0.]);
        assert_eq!(probe_set.dark_zone().pixels(), &[0, 2, 3]);
        assert_eq!(probe_set.dark_zone_probe(), probe_set.dark_zone());
        assert_eq!(probe_set.probe_amplitude(), Some(20.));
        assert_eq!(probe_set.dark_zone_radii, Some((6., 11.)));
        // pixel 1 of probe 1: real part at [0,1,1], imaginary part at [1,1,1]
        let mut delta = DMatrix::zeros(3, 2);
        delta[(1, 1)] = 1.;
        assert_eq!(probe_set.observe(&delta, 1.)[1], Complex::new(4., 10.));
    }

    #[test]
    fn missing_probes_extension() {
        let path = scratch("no-probes.fits");
        crate::fits::write_image(&path, vec![1, 3], vec![0.; 3]).unwrap();
        match ProbeSet::load(&path) {
            Err(Error::Probes { source, .. }) => {
                assert!(matches!(*source, Error::MissingExtension(ref name) if name == "PROBES"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn calibration_inverts_probe_response() {
        let dark_zone = DarkZone::new((1, 2), vec![true, true]).unwrap();
        let probes = vec![DVector::zeros(2), DVector::zeros(2), DVector::zeros(2)];
        let fields = vec![
            DVector::from_vec(vec![Complex::new(1., 0.), Complex::new(0.5, 0.5)]),
            DVector::from_vec(vec![Complex::new(0., 1.), Complex::new(-0.5, 1.)]),
            DVector::from_vec(vec![Complex::new(1., 1.), Complex::new(1., -0.2)]),
        ];
        let probe_set = ProbeSet::calibrate(probes, &fields, dark_zone, 1e-6).unwrap();
        let field = DVector::from_vec(vec![Complex::new(0.3, -0.1), Complex::new(-0.2, 0.4)]);
        // I(+) - I(-) = 2 Re(E conj(ΔE))
        let delta = DMatrix::from_fn(2, 3, |k, p| 2. * (field[k] * fields[p][k].conj()).re);
        let estimate = probe_set.observe(&delta, 1.);
        for (e, f) in estimate.iter().zip(field.iter()) {
            assert!((e - f).norm() < 1e-12);
        }
    }
}
