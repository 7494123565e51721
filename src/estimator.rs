//! # Electric field estimation
//!
//! Pairwise probing: the dark zone electric field is estimated from the
//! intensity differences of coronagraphic images taken with each probe
//! added to and subtracted from the DM commands.

use crate::{
    devices::FieldOracle,
    fits::Header,
    optics::{ActuatorLayout, DarkZone, Wavelength},
    probes::ProbeSet,
    Result,
};
use nalgebra::{Complex, DMatrix, DVector};

/// Pairwise estimation inputs
pub struct PairwiseRequest<'a> {
    /// DM1 command [nm]
    pub dm1: &'a DVector<f64>,
    /// DM2 command [nm]
    pub dm2: &'a DVector<f64>,
    pub probes: &'a ProbeSet,
    pub layout: &'a ActuatorLayout,
    pub wavelength: Wavelength,
    /// Peak of the direct image used to normalize the probe images
    pub direct_peak: f64,
    /// Last measured mean dark zone contrast, used to scale the probes
    pub current_contrast: Option<f64>,
    /// Control weight of the wavelength, no probing is done if zero
    pub control_weight: f64,
}

/// Pairwise estimation outputs
#[derive(Debug, Clone)]
pub struct PairwiseEstimate {
    /// Dark zone electric field
    pub field: DVector<Complex<f64>>,
    /// Last positive probe image, normalized to the direct peak
    pub probe_example: Option<DVector<f64>>,
    /// Lowest dark zone SNR of the probe images
    pub probe_snr: Option<f64>,
    /// Factor applied to the probes
    pub probe_scale: f64,
}
impl PairwiseEstimate {
    fn unobserved(n_pixel: usize) -> Self {
        Self {
            field: DVector::from_element(n_pixel, Complex::new(0f64, 0f64)),
            probe_example: None,
            probe_snr: None,
            probe_scale: 0f64,
        }
    }
}

/// Probe scaling factor
///
/// Once the contrast is known, the probe amplitude is reduced to
/// `20λ√contrast`, it is never increased.
pub fn probe_amplitude_scaling(
    wavelength: Wavelength,
    current_contrast: Option<f64>,
    probe_amplitude: Option<f64>,
) -> f64 {
    match (current_contrast, probe_amplitude) {
        (Some(contrast), Some(amplitude)) if contrast > 0f64 && amplitude > 0f64 => {
            let desired = 20f64 * wavelength.meters() * contrast.sqrt();
            (desired / (amplitude * 1e-9)).min(1f64)
        }
        _ => 1f64,
    }
}

/// Estimates the dark zone electric field by pairwise probing
///
/// `take_image(dm1, dm2, suffix, wavelength)` must return a coronagraphic image
/// over the focal-plane grid and its header. The header `SNR_DZ` keyword, if present,
/// is collected as the probe image SNR.
pub fn take_electric_field_pairwise<F>(
    request: PairwiseRequest<'_>,
    mut take_image: F,
) -> Result<PairwiseEstimate>
where
    F: FnMut(&DVector<f64>, &DVector<f64>, &str, Wavelength) -> Result<(DVector<f64>, Header)>,
{
    let probes = request.probes;
    let dark_zone: &DarkZone = probes.dark_zone();
    if request.control_weight == 0f64 {
        return Ok(PairwiseEstimate::unobserved(dark_zone.len()));
    }
    let scale = probe_amplitude_scaling(
        request.wavelength,
        request.current_contrast,
        probes.probe_amplitude(),
    );
    if scale < 1f64 {
        log::info!(
            "Scaling probes by {:.3} at {} for a contrast of {:.3e}",
            scale,
            request.wavelength,
            request.current_contrast.unwrap_or_default()
        );
    }

    let mut delta_intensity = DMatrix::zeros(dark_zone.len(), probes.len());
    let mut probe_example = None;
    let mut probe_snr: Option<f64> = None;
    for (i, probe) in probes.probes().iter().enumerate() {
        let (p1, p2) = request.layout.split_command_vector(&(probe * scale))?;
        let mut images = Vec::with_capacity(2);
        for (sign, name) in [(1f64, "pos"), (-1f64, "neg")] {
            let dm1 = request.dm1 + &p1 * sign;
            let dm2 = request.dm2 + &p2 * sign;
            let (image, header) =
                take_image(&dm1, &dm2, &format!("probe_{i}_{name}"), request.wavelength)?;
            if let Some(snr) = header.get_f64("SNR_DZ").filter(|snr| *snr > 0f64) {
                probe_snr = Some(probe_snr.map_or(snr, |s| s.min(snr)));
            }
            images.push(image / request.direct_peak);
        }
        let diff = dark_zone.select(&images[0]) - dark_zone.select(&images[1]);
        delta_intensity.set_column(i, &diff);
        probe_example = images.into_iter().next();
    }
    Ok(PairwiseEstimate {
        field: probes.observe(&delta_intensity, scale),
        probe_example,
        probe_snr,
        probe_scale: scale,
    })
}

/// Dark zone electric field given by a simulated testbed
pub fn perfect_knowledge(
    oracle: &mut dyn FieldOracle,
    dm1: &DVector<f64>,
    dm2: &DVector<f64>,
    wavelength: Wavelength,
    dark_zone: &DarkZone,
) -> Result<DVector<Complex<f64>>> {
    let field = oracle.true_field(dm1, dm2, wavelength)?;
    Ok(dark_zone.select(&field))
}
