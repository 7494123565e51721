use std::{
    cell::RefCell,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use nalgebra::{Complex, DVector};
use strokemin::{
    config::{ChannelConfig, ControlSettings, DmSettings},
    devices::FieldOracle,
    simulator::{calibrated_probes, sinusoidal_jacobian, LinearTestbed},
    ActuatorLayout, BroadbandStrokeMinimization, ByWavelength, DarkZone, Error, Phase,
    StrokeMinConfig, StrokeMinimization, WavefrontControl, Wavelength,
};

const GRID: (usize, usize) = (4, 4);

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("strokemin-closed-loop-{}", std::process::id()))
        .join(name);
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn dark_zone() -> DarkZone {
    let mut mask = vec![false; GRID.0 * GRID.1];
    for i in [1, 2, 5, 6] {
        mask[i] = true;
    }
    DarkZone::new(GRID, mask).unwrap()
}

/// A channel: wavelength [nm], Jacobian scale and control weight
type Channel = (f64, f64, f64);

/// Simulated testbed with a DM1-correctable aberration and the matching configuration,
/// the direct images use the `nd_2` filter if `nd` is set
fn toy_bench(
    dir: &Path,
    channels: &[Channel],
    nd: bool,
) -> anyhow::Result<(LinearTestbed, StrokeMinConfig)> {
    let layout = ActuatorLayout::full(3, 3);
    let n_grid = GRID.0 * GRID.1;
    let aberration = DVector::from_fn(layout.len(), |i, _| 1.5 * (0.9 * i as f64 + 0.4).cos());
    let mut fields = vec![];
    let mut channel_configs = vec![];
    for &(wavelength, scale, control_weight) in channels {
        let jacobian = sinusoidal_jacobian(layout.len(), n_grid, scale);
        let probes = calibrated_probes(&jacobian, &layout, dark_zone(), 3, 5.)?;
        let jacobian_path = dir.join(format!("jacobian_{wavelength:.0}nm.fits"));
        let probes_path = dir.join(format!("probes_{wavelength:.0}nm.fits"));
        jacobian.save(&jacobian_path)?;
        probes.save(&probes_path)?;
        let field = jacobian.field_response(&aberration)?;
        fields.push((Wavelength(wavelength), (jacobian, field)));
        channel_configs.push(ChannelConfig {
            wavelength,
            jacobian: jacobian_path,
            probes: probes_path,
            nd_direct: nd.then(|| "nd_2".to_string()),
            nd_coron: nd.then(|| "clear".to_string()),
            control_weight,
            spectral_weight: 1.,
        });
    }
    let mut testbed = LinearTestbed::new(GRID, layout, ByWavelength::new(fields)?)?;
    if nd {
        testbed = testbed.nd_filter("nd_2", 0.01);
    }
    let config = StrokeMinConfig {
        data_root: dir.join("data"),
        num_iterations: 5,
        control: ControlSettings {
            gamma: 0.5,
            use_dm2: false,
            ..Default::default()
        },
        dm: DmSettings {
            actuator_mask: None,
            actuator_grid: (3, 3),
        },
        channels: channel_configs,
        ..Default::default()
    };
    Ok((testbed, config))
}

#[test]
fn monochromatic_digging() -> anyhow::Result<()> {
    let dir = scratch("monochromatic");
    let (testbed, config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    let mut control = StrokeMinimization::new(config)?;
    let mut devices = testbed.devices().open()?;

    control.take_reference_images(&mut devices)?;
    assert_eq!(control.phase(), Phase::Iterating(0));
    let initial = control.history().initial_contrast().unwrap();
    let truth = testbed.contrast(&dark_zone(), Wavelength(640.))?;
    assert!((initial - truth).abs() < 1e-9 * truth);

    while let Phase::Iterating(_) = control.phase() {
        let before = control.actuators().clone();
        control.iterate(&mut devices)?;
        let correction = control.last_correction().unwrap();
        let expected = &before.dm1 - correction;
        assert!((&control.actuators().dm1 - expected).amax() < 1e-12);
        assert_eq!(control.actuators().dm2, before.dm2);
    }
    assert_eq!(control.phase(), Phase::Finished);

    let history = control.history();
    assert_eq!(history.records().len(), 5);
    assert!(history.records().iter().all(|record| record.gamma == 0.5));
    let last = history.last_contrast().unwrap();
    assert!(last < 0.05 * initial, "{last:e} vs {initial:e}");
    assert!(testbed.contrast(&dark_zone(), Wavelength(640.))? < 0.05 * initial);

    let run = control.run_directory();
    for file in [
        "before/coron_640nm_cal.fits",
        "before/direct_640nm.fits",
        "iter0000/E_estimated_unscaled.fits",
        "iter0000/coron_640nm_probe_0_pos_cal.fits",
        "iter0000/checkpoint.bin",
        "iter0004/dm_command/dm1_command_2d_noflat.fits",
        "iter0004/pupil.fits",
        "probes/probe_2_dm1.fits",
        "probes/probes_640nm.fits",
        "history.pkl",
        "metrics.csv",
    ] {
        assert!(run.join(file).is_file(), "missing {file}");
    }
    let metrics = fs::read_to_string(run.join("metrics.csv"))?;
    assert_eq!(metrics.lines().count(), 7);
    Ok(())
}

#[test]
fn resume_from_previous_run() -> anyhow::Result<()> {
    let dir = scratch("resume");
    let (testbed, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    config.num_iterations = 12;
    let mut control = StrokeMinimization::new(config.clone())?;
    let mut devices = testbed.devices().open()?;
    control.take_reference_images(&mut devices)?;
    let mut snapshot = None;
    while let Phase::Iterating(i) = control.phase() {
        control.iterate(&mut devices)?;
        if i == 10 {
            snapshot = Some((control.actuators().clone(), control.mu()));
        }
    }
    let (actuators, mu) = snapshot.unwrap();

    config.resume.resume = true;
    config.num_iterations = 1;
    let resumed = StrokeMinimization::new(config)?;
    assert!((&resumed.actuators().dm1 - &actuators.dm1).amax() < 1e-9);
    assert!((&resumed.actuators().dm2 - &actuators.dm2).amax() < 1e-9);
    assert_eq!(resumed.mu(), mu);
    assert_ne!(resumed.run_directory(), control.run_directory());
    Ok(())
}

#[test]
fn perfect_knowledge() -> anyhow::Result<()> {
    let dir = scratch("perfect_knowledge");
    let (testbed, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    config.num_iterations = 3;
    config.control.perfect_knowledge_mode = true;

    let mut control = StrokeMinimization::new(config.clone())?;
    let mut devices = testbed.devices().open()?;
    control.run(&mut devices)?;
    let contrasts = control.history().mean_contrasts_image();
    assert!(contrasts[3] < 0.2 * contrasts[0]);

    let mut control = StrokeMinimization::new(config)?;
    devices.oracle = None;
    control.take_reference_images(&mut devices)?;
    assert!(matches!(
        control.iterate(&mut devices),
        Err(Error::NoFieldOracle)
    ));
    Ok(())
}

#[test]
fn implausible_correction() -> anyhow::Result<()> {
    let dir = scratch("implausible");
    let (testbed, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    config.control.max_correction_ptv = 1e-3;
    let mut control = StrokeMinimization::new(config)?;
    let mut devices = testbed.devices().open()?;
    control.take_reference_images(&mut devices)?;
    let before = control.actuators().clone();
    assert!(matches!(
        control.iterate(&mut devices),
        Err(Error::ImplausibleCorrection { .. })
    ));
    assert_eq!(control.actuators(), &before);
    assert!(control.history().records().is_empty());
    Ok(())
}

#[test]
fn coronagraph_mode_mismatch() -> anyhow::Result<()> {
    let dir = scratch("coronagraph_mode");
    let (_, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    sinusoidal_jacobian(9, GRID.0 * GRID.1, 1e-3)
        .with_coronagraph_mode("apodized")
        .save(&config.channels[0].jacobian)?;
    config.coronagraph_mode = Some("lyot".into());
    assert!(matches!(
        StrokeMinimization::new(config.clone()),
        Err(Error::CoronagraphMode { .. })
    ));
    config.coronagraph_mode = Some("apodized".into());
    assert!(StrokeMinimization::new(config).is_ok());
    Ok(())
}

#[test]
fn broadband_digging() -> anyhow::Result<()> {
    let dir = scratch("broadband");
    let (testbed, mut config) =
        toy_bench(&dir, &[(620., 1e-3, 1.), (660., 1.1e-3, 0.)], true)?;
    config.num_iterations = 3;
    let dz = dark_zone();
    let truth = (testbed.contrast(&dz, Wavelength(620.))?
        + testbed.contrast(&dz, Wavelength(660.))?)
        / 2.;

    let mut control = BroadbandStrokeMinimization::new(config)?;
    let mut devices = testbed.devices().open()?;
    control.run(&mut devices)?;
    assert_eq!(control.phase(), Phase::Finished);

    for factor in control.flux_attenuation().values() {
        assert!((factor - 100.).abs() < 1e-6);
    }
    let contrasts = control.history().mean_contrasts_image();
    assert_eq!(contrasts.len(), 4);
    assert!((contrasts[0] - truth).abs() < 1e-9 * truth);
    assert!(contrasts[3] < 0.2 * contrasts[0]);

    let record = control.history().last().unwrap();
    assert_eq!(record.e_field_scale_factors.len(), 2);
    assert!(control.num_exposures() > 10);

    let run = control.run_directory();
    assert!(run.join("iter0000/E_estimated_unscaled_620nm.fits").is_file());
    assert!(!run.join("iter0000/E_estimated_unscaled_660nm.fits").exists());
    assert!(!run.join("iter0000/coron_660nm_probe_0_pos_cal.fits").exists());
    assert!(run.join("flux_norm/direct_620nm_nd_direct_cal.fits").is_file());
    assert!(run.join("probes/660nm/probe_0_dm1.fits").is_file());
    Ok(())
}

#[test]
fn telemetry_failures_do_not_stop_the_loop() -> anyhow::Result<()> {
    let dir = scratch("telemetry");
    let (testbed, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    config.num_iterations = 2;
    let testbed = testbed.failing_temperature_sensor().failing_pupil_camera();
    let mut control = StrokeMinimization::new(config)?;
    let mut devices = testbed.devices().open()?;
    control.run(&mut devices)?;
    assert_eq!(control.phase(), Phase::Finished);
    let records = control.history().records();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|record| record.temperature.is_none() && record.humidity.is_none()));
    assert!(!control.run_directory().join("iter0001/pupil.fits").exists());
    Ok(())
}

#[test]
fn unreadable_calibration_files() -> anyhow::Result<()> {
    let dir = scratch("unreadable");
    let (_, mut config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    let probes = config.channels[0].probes.clone();
    config.channels[0].probes = dir.join("missing_probes.fits");
    assert!(matches!(
        StrokeMinimization::new(config.clone()),
        Err(Error::Probes { .. })
    ));
    config.channels[0].probes = probes;
    config.channels[0].jacobian = dir.join("missing_jacobian.fits");
    assert!(matches!(
        StrokeMinimization::new(config.clone()),
        Err(Error::Jacobian { .. })
    ));

    let mut header = String::new();
    for card in [
        "SIMPLE  =                    T",
        "BITPIX  =                  -64",
        "NAXIS   =                    2",
        "NAXIS1  =                   -1",
        "NAXIS2  =                   18",
        "END",
    ] {
        header.push_str(&format!("{card:<80}"));
    }
    let mut bytes = header.into_bytes();
    bytes.resize(2 * 2880, b' ');
    fs::write(&config.channels[0].jacobian, bytes)?;
    assert!(matches!(
        StrokeMinimization::new(config),
        Err(Error::Jacobian { .. })
    ));
    Ok(())
}

#[test]
fn camera_failure_aborts_iteration() -> anyhow::Result<()> {
    let dir = scratch("camera_failure");
    let (testbed, config) = toy_bench(&dir, &[(640., 1e-3, 1.)], false)?;
    let mut control = StrokeMinimization::new(config)?;
    let mut devices = testbed.devices().open()?;
    control.take_reference_images(&mut devices)?;

    // the DMs share the testbed state with the open devices
    let captures = testbed.captures();
    let _testbed = testbed.failing_camera_after(captures + 3);
    let before = control.actuators().clone();
    let mu = control.mu();
    assert!(matches!(
        control.iterate(&mut devices),
        Err(Error::Device { .. })
    ));
    assert_eq!(control.actuators(), &before);
    assert_eq!(control.mu(), mu);
    assert!(control.last_correction().is_none());
    assert!(control.history().records().is_empty());
    let iteration = control.run_directory().join("iter0000");
    assert!(!iteration.join("dm_command").exists());
    assert!(!iteration.join("checkpoint.bin").exists());
    Ok(())
}

/// Field oracle logging the wavelengths it is queried at
struct LoggingOracle {
    testbed: LinearTestbed,
    queries: Rc<RefCell<Vec<f64>>>,
}
impl FieldOracle for LoggingOracle {
    fn true_field(
        &mut self,
        dm1: &DVector<f64>,
        dm2: &DVector<f64>,
        wavelength: Wavelength,
    ) -> strokemin::Result<DVector<Complex<f64>>> {
        self.queries.borrow_mut().push(wavelength.nm());
        self.testbed.field(dm1, dm2, wavelength)
    }
}

#[test]
fn broadband_perfect_knowledge_skips_uncontrolled_wavelengths() -> anyhow::Result<()> {
    let dir = scratch("broadband_perfect_knowledge");
    let (testbed, mut config) =
        toy_bench(&dir, &[(620., 1e-3, 1.), (660., 1.1e-3, 0.)], false)?;
    config.num_iterations = 2;
    config.control.perfect_knowledge_mode = true;

    let queries = Rc::new(RefCell::new(vec![]));
    let mut devices = testbed.devices().open()?;
    devices.oracle = Some(Box::new(LoggingOracle {
        testbed: testbed.clone(),
        queries: queries.clone(),
    }));
    let mut control = BroadbandStrokeMinimization::new(config)?;
    control.run(&mut devices)?;

    assert_eq!(*queries.borrow(), vec![620., 620.]);
    let contrasts = control.history().mean_contrasts_image();
    assert!(contrasts[2] < contrasts[0]);
    Ok(())
}
