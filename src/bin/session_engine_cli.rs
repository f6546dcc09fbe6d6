use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use session_engine::config::{EngineConfig, OutputMode, CONFIG};
use session_engine::dsp::binaural::{self, BinauralBand, Goal};
use session_engine::dsp::noise::{self, NoiseKind};
use session_engine::mixdown::{mixdown_to_wav, render_to_wav, save_wave, MixSettings};
use session_engine::models::{ChannelId, PreludePreset, SessionDescriptor, SourceDescriptor, TimerPreset, TrackCatalog};
use session_engine::session::{SessionOptions, SessionSequencer};
use session_engine::transport::{PlayerProfile, TransportController, TransportState};
use tracing_subscriber::EnvFilter;

/// Play, render and mix relaxation sessions
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Loop music, a binaural bed and/or generated noise, optionally with a timer
    Ambience(AmbienceArgs),
    /// Play a generated session (prelude, voice, closing fade)
    Session(SessionArgs),
    /// Write a generated noise or binaural bed to a WAV file
    Noise(NoiseArgs),
    /// Mix voice, music and binaural stems into one WAV
    Mixdown(MixdownArgs),
    /// Generate a default config file and exit
    GenerateConfig(ConfigArgs),
}

#[derive(ClapArgs)]
struct AmbienceArgs {
    /// Music track: catalog id, library path or URL
    #[arg(long)]
    music: Option<String>,
    /// Generated bed: pink, wind or rain
    #[arg(long)]
    noise: Option<String>,
    /// Binaural track: library path or URL
    #[arg(long, conflicts_with = "beat")]
    binaural: Option<String>,
    /// Synthesize a binaural bed at this beat frequency instead
    #[arg(long)]
    beat: Option<f32>,
    /// Track catalog JSON used to resolve ids
    #[arg(long)]
    catalog: Option<PathBuf>,
    #[arg(long, default_value_t = 70.0)]
    music_volume: f32,
    #[arg(long, default_value_t = 50.0)]
    noise_volume: f32,
    #[arg(long, default_value_t = 30.0)]
    binaural_volume: f32,
    /// Countdown in minutes (15, 30 or 60)
    #[arg(long)]
    timer: Option<u32>,
    /// Fade-out on stop, in seconds (5-60)
    #[arg(long)]
    fade_out: Option<f32>,
    /// Render offline to this WAV instead of playing
    #[arg(long)]
    render: Option<PathBuf>,
    /// Length of an offline render in seconds
    #[arg(long, default_value_t = 60.0)]
    seconds: f64,
}

#[derive(ClapArgs)]
struct SessionArgs {
    /// Session descriptor JSON as produced by the generation backend
    #[arg(long)]
    descriptor: PathBuf,
    /// Ambience-only lead-in in seconds (0, 10, 30 or 60)
    #[arg(long, default_value_t = 10)]
    prelude: u32,
    /// Play the pre-mixed track when available
    #[arg(long, default_value_t = false)]
    mixdown: bool,
    /// Optional generated bed: pink, wind or rain
    #[arg(long)]
    noise: Option<String>,
    /// Requested session length in minutes
    #[arg(long)]
    minutes: Option<f64>,
    /// Render offline to this WAV instead of playing
    #[arg(long)]
    render: Option<PathBuf>,
}

#[derive(ClapArgs)]
struct NoiseArgs {
    /// pink, wind or rain; ignored with --binaural
    #[arg(long, default_value = "pink")]
    kind: String,
    /// Write a binaural bed instead of noise
    #[arg(long, default_value_t = false)]
    binaural: bool,
    #[arg(long, value_enum, default_value_t = BandArg::Auto)]
    band: BandArg,
    #[arg(long, default_value = "other")]
    goal: String,
    /// Explicit beat frequency, overrides band and goal
    #[arg(long)]
    beat: Option<f32>,
    #[arg(long, default_value_t = 12.0)]
    seconds: f32,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy)]
enum BandArg {
    Auto,
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl From<BandArg> for BinauralBand {
    fn from(b: BandArg) -> Self {
        match b {
            BandArg::Auto => BinauralBand::Auto,
            BandArg::Delta => BinauralBand::Delta,
            BandArg::Theta => BinauralBand::Theta,
            BandArg::Alpha => BinauralBand::Alpha,
            BandArg::Beta => BinauralBand::Beta,
            BandArg::Gamma => BinauralBand::Gamma,
        }
    }
}

#[derive(ClapArgs)]
struct MixdownArgs {
    #[arg(long)]
    voice: PathBuf,
    #[arg(long)]
    music: PathBuf,
    #[arg(long)]
    binaural: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 8000)]
    sample_rate: u32,
    #[arg(long, default_value_t = false)]
    no_ducking: bool,
}

#[derive(ClapArgs)]
struct ConfigArgs {
    /// Output path for the generated configuration
    #[arg(long, default_value = "config.toml")]
    out: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ambience(args) => ambience_command(args)?,
        Commands::Session(args) => session_command(args)?,
        Commands::Noise(args) => noise_command(args)?,
        Commands::Mixdown(args) => {
            let settings = MixSettings {
                sample_rate: args.sample_rate,
                ducking_enabled: !args.no_ducking,
                ..MixSettings::default()
            };
            let out = output_path(&args.out);
            mixdown_to_wav(&args.voice, &args.music, &args.binaural, &out, &settings)?;
            println!("Mixdown written to {}", out.display());
        }
        Commands::GenerateConfig(cfg) => {
            EngineConfig::generate_default(&cfg.out)?;
            println!("Generated default config at {}", cfg.out);
        }
    }
    Ok(())
}

fn output_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        CONFIG.output_dir.join(path)
    }
}

fn config_for(render: bool) -> EngineConfig {
    let mut config = CONFIG.clone();
    if render {
        config.output = OutputMode::Offline;
    }
    config
}

fn parse_noise(id: &str) -> Result<NoiseKind, String> {
    NoiseKind::from_id(id).ok_or_else(|| format!("unknown noise kind: {id}"))
}

fn ambience_command(args: AmbienceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = config_for(args.render.is_some());
    let loop_seconds = config.noise_loop_seconds;
    let mut profile = PlayerProfile::ambience();
    if let Some(fade) = args.fade_out {
        profile = profile.with_fade_out(fade);
    }
    let transport = TransportController::new(config, profile)?;

    let catalog = match &args.catalog {
        Some(path) => TrackCatalog::from_json(&std::fs::read_to_string(path)?)?,
        None => TrackCatalog::default(),
    };
    let music = args.music.as_deref().map(|id| {
        catalog
            .resolve(id, loop_seconds)
            .unwrap_or_else(|| SourceDescriptor::streamed(id, true))
    });
    let noise = args
        .noise
        .as_deref()
        .map(parse_noise)
        .transpose()?
        .map(|kind| SourceDescriptor::generated(kind, loop_seconds));
    let binaural = match (args.binaural.as_deref(), args.beat) {
        (Some(url), _) => Some(SourceDescriptor::streamed(url, true)),
        (None, Some(beat_hz)) => Some(SourceDescriptor::Binaural {
            carrier_hz: binaural::DEFAULT_CARRIER_HZ,
            beat_hz,
            duration_seconds: loop_seconds,
        }),
        (None, None) => None,
    };
    if music.is_none() && noise.is_none() && binaural.is_none() {
        return Err("nothing to play: pass --music, --binaural/--beat and/or --noise".into());
    }

    for (channel, source, volume) in [
        (ChannelId::Music, music, args.music_volume),
        (ChannelId::Binaural, binaural, args.binaural_volume),
        (ChannelId::Noise, noise, args.noise_volume),
    ] {
        transport.set_enabled(channel, source.is_some())?;
        transport.set_source(channel, source);
        transport.set_volume(channel, volume);
    }
    if let Some(minutes) = args.timer {
        transport.set_timer(Some(TimerPreset::try_from(minutes)?))?;
    }
    transport.play()?;

    if let Some(out) = args.render {
        let out = output_path(&out);
        let seconds = render_to_wav(&transport, &out, args.seconds)?;
        println!("Rendered {seconds:.1}s of ambience to {}", out.display());
        return Ok(());
    }

    println!("Playing ambience... press Ctrl+C to fade out");
    let interrupted = interrupt_flag()?;
    let mut stopping = false;
    while transport.state() != TransportState::Idle {
        if interrupted.load(Ordering::SeqCst) && !stopping {
            transport.stop(None);
            stopping = true;
        }
        if let Some(left) = transport.timer_remaining_secs() {
            print!("\rtimer {:02}:{:02}   ", left / 60, left % 60);
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    println!();
    Ok(())
}

fn session_command(args: SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = config_for(args.render.is_some());
    let loop_seconds = config.noise_loop_seconds;
    let descriptor = SessionDescriptor::from_json(&std::fs::read_to_string(&args.descriptor)?)?;
    let options = SessionOptions {
        prelude: PreludePreset::try_from(args.prelude)?,
        prefer_mixdown: args.mixdown,
        noise: args
            .noise
            .as_deref()
            .map(parse_noise)
            .transpose()?
            .map(|kind| SourceDescriptor::generated(kind, loop_seconds)),
        total_seconds: args.minutes.map(|m| m * 60.0),
    };
    let sequencer = SessionSequencer::new(TransportController::new(config, PlayerProfile::session())?);
    sequencer.start(&descriptor, &options)?;

    if let Some(out) = args.render {
        let out = output_path(&out);
        // long enough for any session the backend produces
        let seconds = render_to_wav(sequencer.transport(), &out, 4.0 * 3600.0)?;
        println!("Rendered {seconds:.1}s session to {}", out.display());
        return Ok(());
    }

    println!("Playing session... press Ctrl+C to stop");
    let interrupted = interrupt_flag()?;
    while sequencer.is_active() {
        if interrupted.load(Ordering::SeqCst) {
            sequencer.stop();
            break;
        }
        let p = sequencer.progress();
        if let Some(phase) = p.phase {
            print!(
                "\r{:>13} {:>5.1}%  {:>6.0}/{:.0}s   ",
                phase.label(),
                p.phase_fraction * 100.0,
                p.elapsed_seconds,
                p.total_seconds
            );
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    println!();
    Ok(())
}

fn noise_command(args: NoiseArgs) -> Result<(), Box<dyn std::error::Error>> {
    let sample_rate = args.sample_rate.unwrap_or(CONFIG.sample_rate);
    let buffer = if args.binaural {
        let goal: Goal = serde_json::from_value(serde_json::Value::String(args.goal.to_ascii_lowercase()))?;
        let (band, beat) = binaural::pick_band_and_beat(args.band.into(), goal, args.beat);
        println!("Binaural band {band:?} at {beat} Hz");
        binaural::synthesize(binaural::DEFAULT_CARRIER_HZ, beat, args.seconds, sample_rate)
    } else {
        noise::synthesize(parse_noise(&args.kind)?, args.seconds, sample_rate)
    };
    let stereo: Vec<f32> = (0..buffer.frames())
        .flat_map(|i| {
            let (l, r) = buffer.frame(i);
            [l, r]
        })
        .collect();
    let out = output_path(&args.out);
    save_wave(&stereo, sample_rate, &out)?;
    println!("Wrote {:.1}s to {}", buffer.duration_seconds(), out.display());
    Ok(())
}

fn interrupt_flag() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;
    Ok(flag)
}
