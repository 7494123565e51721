use std::path::PathBuf;

use clap::Parser;
use linya::{Bar, Progress};
use nalgebra::DVector;
use strokemin::{
    simulator::LinearTestbed, BroadbandStrokeMinimization, Phase, StrokeMinConfig,
    StrokeMinimization, WavefrontControl,
};

/// Dark zone digging with stroke minimization
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// number of iterations, overrides the configuration
    #[arg(short, long)]
    iterations: Option<usize>,
    /// directory the run directory is created into, overrides the configuration
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// resume from the most recent run with the same suffix
    #[arg(long)]
    resume: bool,
    /// run against the linear testbed simulator
    #[arg(long)]
    simulate: bool,
    /// simulated static aberration amplitude [nm]
    #[arg(long, default_value_t = 2.)]
    aberration: f64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = StrokeMinConfig::from_toml_file(&cli.config)?;
    if let Some(num_iterations) = cli.iterations {
        config.num_iterations = num_iterations;
    }
    if let Some(data_root) = cli.data_root {
        config.data_root = data_root;
    }
    if cli.resume {
        config.resume.resume = true;
    }
    if !cli.simulate {
        anyhow::bail!("no testbed hardware drivers are available, run with --simulate");
    }

    let n_actuator = config.dm.layout()?.len();
    let aberration = DVector::from_fn(2 * n_actuator, |i, _| {
        cli.aberration * (0.7 * i as f64).sin()
    });
    let testbed = LinearTestbed::from_config(&config, &aberration)?;
    let mut devices = testbed.devices().open()?;

    let num_iterations = config.num_iterations;
    let mut control: Box<dyn WavefrontControl> = if config.channels.len() > 1 {
        Box::new(BroadbandStrokeMinimization::new(config)?)
    } else {
        Box::new(StrokeMinimization::new(config)?)
    };

    control.take_reference_images(&mut devices)?;
    let mut progress = Progress::new();
    let bar: Bar = progress.bar(num_iterations, "Stroke minimization");
    while let Phase::Iterating(i) = control.phase() {
        control.iterate(&mut devices)?;
        progress.set_and_draw(&bar, i + 1);
    }

    let contrasts = control.history().mean_contrasts_image();
    if let (Some(first), Some(last)) = (contrasts.first(), contrasts.last()) {
        println!(
            "Mean dark zone contrast: {:.3e} -> {:.3e} in {} iterations",
            first,
            last,
            contrasts.len() - 1
        );
    }
    Ok(())
}
