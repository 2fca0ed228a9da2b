/// fx-render - render audio files through the Soul Player effect chain
mod render;

use clap::{Args, Parser, Subcommand, ValueEnum};
use render::RenderSettings;
use soul_effects::{
    DirectoryIrCatalog, EffectsConfig, EffectsSession, IrCatalog, PerformanceTier, ReverbPreset,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fx-render")]
#[command(about = "Render audio through the Soul Player effect chain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a WAV file through the effect chain
    Render {
        /// Input WAV file
        input: PathBuf,
        /// Output WAV file (32-bit float stereo)
        output: PathBuf,
        /// Configuration file path
        #[arg(short, long, env = "SOUL_FX_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        effects: EffectArgs,
    },
    /// List the impulse responses of a directory
    ListIrs {
        /// Directory holding `.irs` files
        directory: PathBuf,
        /// Public prefix of the listed ids
        #[arg(long, default_value = "/eq/irs/")]
        prefix: String,
    },
    /// Show the built-in reverb presets
    Presets,
}

#[derive(Args)]
struct EffectArgs {
    /// Master volume
    #[arg(long, default_value_t = 1.0)]
    volume: f32,
    /// Comma separated EQ band gains in dB, low to high
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    eq: Vec<f64>,
    /// Enable the algorithmic reverb with this preset
    #[arg(long)]
    reverb: Option<ReverbPreset>,
    /// Enable the compressor
    #[arg(long)]
    compressor: bool,
    /// Enable the spatializer
    #[arg(long)]
    spatial: bool,
    /// Enable the stereo widener with this amount (0-1)
    #[arg(long)]
    widener: Option<f64>,
    /// Enable loudness normalization toward this target in LUFS
    #[arg(long, allow_negative_numbers = true)]
    loudness: Option<f64>,
    /// Directory catalog for convolution impulse responses
    #[arg(long)]
    ir_dir: Option<PathBuf>,
    /// Impulse response id to convolve with
    #[arg(long)]
    ir: Option<String>,
    /// Convolution wet share (0-1)
    #[arg(long, default_value_t = 0.3)]
    ir_mix: f64,
    /// Performance tier
    #[arg(long, value_enum, default_value_t = TierArg::High)]
    tier: TierArg,
    /// Seconds rendered after the input ends
    #[arg(long, default_value_t = 2.0)]
    tail: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    Low,
    Balanced,
    High,
}

impl From<TierArg> for PerformanceTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Low => PerformanceTier::Low,
            TierArg::Balanced => PerformanceTier::Balanced,
            TierArg::High => PerformanceTier::High,
        }
    }
}

impl EffectArgs {
    fn settings(&self) -> RenderSettings {
        RenderSettings {
            volume: self.volume,
            eq_gains: self.eq.clone(),
            reverb: self.reverb,
            compressor: self.compressor,
            spatial: self.spatial,
            widener: self.widener,
            loudness_target: self.loudness,
            impulse_response: self.ir.clone(),
            convolver_mix: self.ir_mix,
            tier: self.tier.into(),
            tail: self.tail,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fx_render=info,soul_effects=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            input,
            output,
            config,
            effects,
        } => {
            let config = EffectsConfig::load_from(config.as_deref())?;
            let sample_rate = config.audio.sample_rate;
            let prefix = config.catalog.public_prefix.clone();

            let mut builder = EffectsSession::builder()
                .config(config)
                .without_storage();
            if let Some(dir) = &effects.ir_dir {
                builder = builder.catalog(Arc::new(DirectoryIrCatalog::new(dir, prefix)));
            }
            let session = builder.build()?;

            let buffer = render::read_input(&input, sample_rate)?;
            tracing::info!(
                input = %input.display(),
                channels = buffer.number_of_channels(),
                seconds = buffer.duration(),
                "Rendering"
            );

            let (samples, report) = render::render(&session, buffer, &effects.settings()).await?;
            render::write_output(&output, &samples, report.sample_rate)?;

            println!(
                "Wrote {} ({} frames @ {} Hz, peak {:.3})",
                output.display(),
                report.frames,
                report.sample_rate,
                report.peak
            );
            if effects.loudness.is_some() {
                println!("Final momentary loudness: {:.1} LUFS", report.momentary_lufs);
            }
        }
        Commands::ListIrs { directory, prefix } => {
            let catalog = DirectoryIrCatalog::new(directory, prefix);
            for id in catalog.list().await? {
                println!("{id}");
            }
        }
        Commands::Presets => {
            for preset in ReverbPreset::ALL {
                match preset.builtin() {
                    Some(p) => println!(
                        "{:<8} decay {:.2}  damping {:>6.0} Hz  mix {:.2}  pre-delay {:.3} s",
                        preset.id(),
                        p.decay,
                        p.damping,
                        p.mix,
                        p.pre_delay
                    ),
                    None => println!("{:<8} (your own values)", preset.id()),
                }
            }
        }
    }

    Ok(())
}
