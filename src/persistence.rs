//! # Run files
//!
//! Layout of a run directory:
//!
//! ```text
//! <data root>/<timestamp>_<suffix>/
//!     metrics.csv
//!     history.pkl
//!     probes/
//!     flux_norm/
//!     before/
//!     iter0000/
//!         checkpoint.bin
//!         dm_command/dm1_command_2d_noflat.fits
//!         dm_command/dm2_command_2d_noflat.fits
//!         E_estimated_unscaled_<λ>nm.fits
//!         ...
//! ```
//!
//! DM commands are saved in meters, the control loop works in nanometers.

use crate::{
    control::ActuatorState,
    fits::{FitsReader, Hdu, HduList},
    optics::{ActuatorLayout, DarkZone},
    probes::ProbeSet,
    Error, Result,
};
use glob::{glob, Pattern};
use nalgebra::{Complex, DVector};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

const DM_COMMAND_DIR: &str = "dm_command";
const CHECKPOINT: &str = "checkpoint.bin";

/// Current local time for file names and logs
pub fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H-%M-%S%.3f")
        .to_string()
}

/// Root directory of a control loop run
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}
impl RunDirectory {
    /// Creates `<data_root>/<timestamp>_<suffix>`
    pub fn create<P: AsRef<Path>>(data_root: P, suffix: &str) -> Result<Self> {
        let root = data_root
            .as_ref()
            .join(format!("{}_{}", timestamp(), suffix));
        fs::create_dir_all(&root)?;
        log::info!("Run directory: {:?}", root);
        Ok(Self { root })
    }
    pub fn path(&self) -> &Path {
        &self.root
    }
    pub fn before(&self) -> PathBuf {
        self.root.join("before")
    }
    pub fn iteration(&self, i: usize) -> PathBuf {
        self.root.join(format!("iter{i:04}"))
    }
    pub fn probes(&self) -> PathBuf {
        self.root.join("probes")
    }
    pub fn flux_normalization(&self) -> PathBuf {
        self.root.join("flux_norm")
    }
    pub fn history(&self) -> PathBuf {
        self.root.join("history.pkl")
    }
    pub fn metrics(&self) -> PathBuf {
        self.root.join("metrics.csv")
    }
}

/// Saves the DM commands under `<dir>/dm_command`
pub fn save_dm_commands<P: AsRef<Path>>(
    dir: P,
    layout: &ActuatorLayout,
    state: &ActuatorState,
) -> Result<PathBuf> {
    let path = dir.as_ref().join(DM_COMMAND_DIR);
    fs::create_dir_all(&path)?;
    let (rows, cols) = layout.shape();
    for (i, command) in [&state.dm1, &state.dm2].into_iter().enumerate() {
        let surface: Vec<f64> = layout
            .to_surface(command)?
            .into_iter()
            .map(|x| x * 1e-9)
            .collect();
        let mut hdu = Hdu::new(vec![rows, cols], surface)?;
        hdu.header.set("UNITS", "m");
        HduList::new(hdu).write(path.join(format!("dm{}_command_2d_noflat.fits", i + 1)))?;
    }
    Ok(path)
}

/// Loads the DM commands saved by [save_dm_commands] from a `dm_command` directory
pub fn load_dm_commands<P: AsRef<Path>>(
    dm_command_dir: P,
    layout: &ActuatorLayout,
) -> Result<ActuatorState> {
    let dir = dm_command_dir.as_ref();
    let load = |i: usize| -> Result<DVector<f64>> {
        let hdu = FitsReader::open(dir.join(format!("dm{i}_command_2d_noflat.fits")))?.primary()?;
        Ok(layout.from_surface(hdu.data())? * 1e9)
    };
    Ok(ActuatorState::new(load(1)?, load(2)?))
}

/// Finds the DM commands to resume from
///
/// The most recent run directory `<data_root>/<timestamp>_<suffix>` with at least
/// `min_iterations` iteration directories is selected and the `dm_command`
/// directory of its penultimate iteration is returned.
pub fn find_resume_dir<P: AsRef<Path>>(
    data_root: P,
    suffix: &str,
    min_iterations: usize,
) -> Result<Option<PathBuf>> {
    let root = Pattern::escape(&data_root.as_ref().to_string_lossy());
    let mut runs: Vec<PathBuf> = glob(&format!("{root}/*_{}", Pattern::escape(suffix)))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.split_once('_'))
                .map_or(false, |(_, run_suffix)| run_suffix == suffix)
        })
        .collect();
    runs.sort();
    for run in runs.into_iter().rev() {
        let run_root = Pattern::escape(&run.to_string_lossy());
        let mut iterations: Vec<PathBuf> = glob(&format!("{run_root}/iter*"))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_dir())
            .collect();
        if iterations.len() < min_iterations.max(2) {
            log::info!(
                "Skipping {:?}: {} iterations only",
                run,
                iterations.len()
            );
            continue;
        }
        iterations.sort();
        let penultimate = &iterations[iterations.len() - 2];
        let dm_command = penultimate.join(DM_COMMAND_DIR);
        if dm_command.is_dir() {
            log::info!("Resuming from {:?}", dm_command);
            return Ok(Some(dm_command));
        }
        log::warn!("No DM commands in {:?}", penultimate);
    }
    Ok(None)
}

/// Loop state saved with the DM commands of every iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: usize,
    /// Tikhonov parameter of the last correction
    pub mu: f64,
    pub num_exposures: usize,
}
impl Checkpoint {
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        bincode::serialize_into(&mut File::create(dir.as_ref().join(CHECKPOINT))?, self)?;
        Ok(())
    }
    /// Loads the checkpoint next to a `dm_command` directory, if any
    pub fn next_to<P: AsRef<Path>>(dm_command_dir: P) -> Result<Option<Self>> {
        match dm_command_dir.as_ref().parent().map(|dir| dir.join(CHECKPOINT)) {
            Some(path) if path.is_file() => Ok(Some(bincode::deserialize_from(File::open(path)?)?)),
            _ => Ok(None),
        }
    }
}

/// Where the initial DM commands come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    /// Resume from the most recent run with the same suffix
    pub resume: bool,
    /// Resume from this `dm_command` directory
    pub dm_command_dir: Option<PathBuf>,
    /// Minimum number of iterations of a run to resume from
    pub min_iterations: usize,
}
impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            resume: false,
            dm_command_dir: None,
            min_iterations: 10,
        }
    }
}

/// Initial state of the control loop
#[derive(Debug, Clone)]
pub struct InitialState {
    pub actuators: ActuatorState,
    /// Checkpoint of the resumed run
    pub checkpoint: Option<Checkpoint>,
    pub resumed_from: Option<PathBuf>,
}

/// Selects the initial DM commands
///
/// In order of precedence: an explicit `dm_command` directory, the most recent
/// run if resuming, the DM settings of the Jacobian or flat DMs.
pub fn initial_state(
    settings: &ResumeSettings,
    data_root: &Path,
    suffix: &str,
    layout: &ActuatorLayout,
    dm_settings: Option<&(DVector<f64>, DVector<f64>)>,
) -> Result<InitialState> {
    let dm_command_dir = match &settings.dm_command_dir {
        Some(dir) => Some(dir.clone()),
        None if settings.resume => {
            let dir = find_resume_dir(data_root, suffix, settings.min_iterations)?;
            if dir.is_none() {
                log::warn!("No previous run to resume from in {:?}", data_root);
            }
            dir
        }
        None => None,
    };
    if let Some(dir) = dm_command_dir {
        return Ok(InitialState {
            actuators: load_dm_commands(&dir, layout)?,
            checkpoint: Checkpoint::next_to(&dir)?,
            resumed_from: Some(dir),
        });
    }
    let actuators = match dm_settings {
        Some((dm1, dm2)) => {
            if dm1.len() != layout.len() {
                return Err(Error::dimension("DM_SETTINGS actuators", layout.len(), dm1.len()));
            }
            log::info!("Starting from the Jacobian DM settings");
            ActuatorState::new(dm1.clone(), dm2.clone())
        }
        None => ActuatorState::flat(layout),
    };
    Ok(InitialState {
        actuators,
        checkpoint: None,
        resumed_from: None,
    })
}

/// Saves a dark zone electric field over the focal-plane grid with `REAL` and `IMAG` extensions
pub fn save_field<P: AsRef<Path>>(
    path: P,
    dark_zone: &DarkZone,
    field: &DVector<Complex<f64>>,
) -> Result<()> {
    let grid = dark_zone.scatter(field, Complex::new(0f64, 0f64));
    let (rows, cols) = dark_zone.grid();
    let part = |f: fn(&Complex<f64>) -> f64, name: &str| -> Result<Hdu> {
        Ok(Hdu::new(vec![rows, cols], grid.iter().map(f).collect())?.named(name))
    };
    HduList::new(Hdu::empty())
        .with(part(|e| e.re, "REAL")?)
        .with(part(|e| e.im, "IMAG")?)
        .write(path)?;
    Ok(())
}

/// Archives the probes into `dir`
///
/// Each probe DM surface is saved as `probe_<i>_dm<1|2>.fits` [m], the probe file
/// and its PDF rendering, if any, are copied next to them.
pub fn archive_probes<P: AsRef<Path>>(
    dir: P,
    probes: &ProbeSet,
    layout: &ActuatorLayout,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let (rows, cols) = layout.shape();
    for (i, probe) in probes.probes().iter().enumerate() {
        let (dm1, dm2) = layout.split_command_vector(probe)?;
        for (k, command) in [dm1, dm2].iter().enumerate() {
            let surface = layout.to_surface(command)?.into_iter().map(|x| x * 1e-9).collect();
            crate::fits::write_image(
                dir.join(format!("probe_{i}_dm{}.fits", k + 1)),
                vec![rows, cols],
                surface,
            )?;
        }
    }
    match probes.path() {
        Some(path) => {
            if let Some(name) = path.file_name() {
                fs::copy(path, dir.join(name))?;
            }
            let pdf = path.with_extension("pdf");
            if let (true, Some(name)) = (pdf.is_file(), pdf.file_name()) {
                if let Err(e) = fs::copy(&pdf, dir.join(name)) {
                    log::warn!("Failed to copy {:?}: {}", pdf, e);
                }
            }
        }
        None => probes.save(dir.join("probes.fits"))?,
    }
    Ok(())
}

/// A row of the metrics file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    #[serde(rename = "time stamp")]
    pub timestamp: String,
    #[serde(rename = "temp (C)")]
    pub temperature: Option<f64>,
    #[serde(rename = "humidity (%)")]
    pub humidity: Option<f64>,
    #[serde(rename = "mean image contrast")]
    pub mean_image_contrast: f64,
}

/// Environment and contrast log, appended to at every iteration
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}
impl MetricsLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
    pub fn append(&self, row: &MetricsRow) -> Result<()> {
        let exists = self.path.is_file();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }
    /// Reads back all the rows
    pub fn rows(&self) -> Result<Vec<MetricsRow>> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        Ok(reader.deserialize().collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("strokemin-persistence-{}", std::process::id()))
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fake_run(root: &Path, name: &str, layout: &ActuatorLayout, n_iteration: usize) {
        for i in 0..n_iteration {
            let dir = root.join(name).join(format!("iter{i:04}"));
            let state = ActuatorState::new(
                DVector::from_element(layout.len(), i as f64),
                DVector::from_element(layout.len(), -(i as f64)),
            );
            save_dm_commands(&dir, layout, &state).unwrap();
        }
    }

    #[test]
    fn resume_from_penultimate_iteration() {
        let root = scratch("resume");
        let layout = ActuatorLayout::full(2, 2);
        fake_run(&root, "2026-01-01T00-00-00.000_stroke_min", &layout, 12);
        fake_run(&root, "2026-01-02T00-00-00.000_stroke_min", &layout, 3);
        fake_run(&root, "2026-01-03T00-00-00.000_other", &layout, 12);
        let dir = find_resume_dir(&root, "stroke_min", 10).unwrap().unwrap();
        assert_eq!(
            dir,
            root.join("2026-01-01T00-00-00.000_stroke_min")
                .join("iter0010")
                .join("dm_command")
        );
        let state = initial_state(
            &ResumeSettings {
                resume: true,
                min_iterations: 10,
                ..Default::default()
            },
            &root,
            "stroke_min",
            &layout,
            None,
        )
        .unwrap();
        for (dm1, dm2) in state.actuators.dm1.iter().zip(state.actuators.dm2.iter()) {
            assert!((dm1 - 10.).abs() < 1e-9);
            assert!((dm2 + 10.).abs() < 1e-9);
        }
        assert!(state.checkpoint.is_none());
        assert!(find_resume_dir(&root, "stroke_min", 20).unwrap().is_none());

        fake_run(&root, "2026-01-04T00-00-00.000_bb_stroke_min", &layout, 12);
        fake_run(&root, "2026-01-05T00-00-00.000_run[1]", &layout, 12);
        let dir = find_resume_dir(&root, "stroke_min", 10).unwrap().unwrap();
        assert!(dir.starts_with(root.join("2026-01-01T00-00-00.000_stroke_min")));
        let dir = find_resume_dir(&root, "run[1]", 10).unwrap().unwrap();
        assert!(dir.starts_with(root.join("2026-01-05T00-00-00.000_run[1]")));
    }

    #[test]
    fn dm_commands_in_meters() {
        let dir = scratch("meters");
        let layout = ActuatorLayout::from_mask((2, 2), &[true, true, false, true]).unwrap();
        let state = ActuatorState::new(
            DVector::from_vec(vec![1., 2., 3.]),
            DVector::from_vec(vec![-4., 0., 5.]),
        );
        let path = save_dm_commands(&dir, &layout, &state).unwrap();
        let hdu = FitsReader::open(path.join("dm1_command_2d_noflat.fits"))
            .unwrap()
            .primary()
            .unwrap();
        let data = hdu.data();
        assert!((data[1] - 2e-9).abs() < 1e-24);
        assert_eq!(data[2], 0.);
        let loaded = load_dm_commands(&path, &layout).unwrap();
        assert!((loaded.dm2[2] - 5.).abs() < 1e-12);
    }

    #[test]
    fn starts_from_jacobian_settings() {
        let root = scratch("settings");
        let layout = ActuatorLayout::full(1, 2);
        let settings = (DVector::from_vec(vec![1., 2.]), DVector::from_vec(vec![3., 4.]));
        let state = initial_state(
            &ResumeSettings::default(),
            &root,
            "stroke_min",
            &layout,
            Some(&settings),
        )
        .unwrap();
        assert_eq!(state.actuators.dm2.as_slice(), &[3., 4.]);
        let flat =
            initial_state(&ResumeSettings::default(), &root, "stroke_min", &layout, None).unwrap();
        assert_eq!(flat.actuators, ActuatorState::flat(&layout));
    }

    #[test]
    fn metrics_header_once() {
        let dir = scratch("metrics");
        let metrics = MetricsLog::new(dir.join("metrics.csv"));
        for (i, temperature) in [Some(21.), None].into_iter().enumerate() {
            metrics
                .append(&MetricsRow {
                    timestamp: format!("t{i}"),
                    temperature,
                    humidity: temperature.map(|_| 10.),
                    mean_image_contrast: 1e-8,
                })
                .unwrap();
        }
        let text = fs::read_to_string(dir.join("metrics.csv")).unwrap();
        assert!(text.starts_with("time stamp,temp (C),humidity (%),mean image contrast"));
        assert_eq!(text.matches("time stamp").count(), 1);
        let rows = metrics.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].temperature, None);
    }

    #[test]
    fn checkpoint_next_to_dm_commands() {
        let dir = scratch("checkpoint");
        let layout = ActuatorLayout::full(1, 1);
        let path = save_dm_commands(&dir, &layout, &ActuatorState::flat(&layout)).unwrap();
        assert!(Checkpoint::next_to(&path).unwrap().is_none());
        let checkpoint = Checkpoint {
            iteration: 4,
            mu: 3e-6,
            num_exposures: 20,
        };
        checkpoint.save(&dir).unwrap();
        assert_eq!(Checkpoint::next_to(&path).unwrap(), Some(checkpoint));
    }
}
