//! # HiCAT stroke minimization
//!
//! Closed-loop dark zone control for a high-contrast imaging testbed:
//! pairwise-probe electric field estimation, stroke minimization DM corrections
//! and the monochromatic and broadband control loops that drive them.

use std::path::PathBuf;

pub mod fits;

pub mod optics;
#[doc(no_inline)]
pub use optics::{ActuatorLayout, ByWavelength, DarkZone, Jacobian, Wavelength};

pub mod probes;
#[doc(no_inline)]
pub use probes::ProbeSet;

pub mod estimator;
pub mod solver;

pub mod control;
#[doc(no_inline)]
pub use control::{ActuatorState, GammaSchedule, Phase, Step, WavefrontControl};

pub mod devices;
#[doc(no_inline)]
pub use devices::DeviceContext;

pub mod exposure;
pub mod history;
pub mod persistence;
pub mod simulator;

pub mod config;
#[doc(no_inline)]
pub use config::StrokeMinConfig;

mod stroke_min;
pub use stroke_min::StrokeMinimization;
mod broadband;
pub use broadband::BroadbandStrokeMinimization;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("can't read Jacobian from {path:?}")]
    Jacobian {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("can't read probes from {path:?}")]
    Probes {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("missing {0} extension")]
    MissingExtension(String),
    #[error("FITS file error")]
    Fits(#[from] fits::FitsError),
    #[error("file system error")]
    Io(#[from] std::io::Error),
    #[error("failed to write metrics")]
    Csv(#[from] csv::Error),
    #[error("failed to pickle iteration history")]
    Pickle(#[from] serde_pickle::Error),
    #[error("failed to (de)serialize checkpoint")]
    Bincode(#[from] bincode::Error),
    #[error("invalid file pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("failed to parse configuration")]
    Config(#[from] toml::de::Error),
    #[error("{what}: expected {expected}, found {found}")]
    Dimension {
        what: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid {name}: {value}")]
    Parameter { name: &'static str, value: f64 },
    #[error("Jacobian is for coronagraph mode {found:?} but the system is configured for {expected:?}")]
    CoronagraphMode { expected: String, found: String },
    #[error("implausibly large correction: requested DM stroke of {ptv} nm PTV exceeds {ceiling} nm")]
    ImplausibleCorrection { ptv: f64, ceiling: f64 },
    #[error("perfect knowledge of the electric field is only available on a simulated testbed")]
    NoFieldOracle,
    #[error("{device}: {message}")]
    Device { device: String, message: String },
    #[error("no channel for wavelength {0} nm")]
    Wavelength(f64),
    #[error("at least one wavelength channel is required")]
    NoChannel,
    #[error("{0}")]
    OutOfSequence(String),
}
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn dimension<S: Into<String>>(what: S, expected: usize, found: usize) -> Self {
        Error::Dimension {
            what: what.into(),
            expected,
            found,
        }
    }
}
