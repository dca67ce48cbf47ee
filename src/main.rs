use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use kittybridge::config::Config;
use kittybridge::display::KittyDisplay;
use kittybridge::emulator::{Emulator, RunStats};
use kittybridge::input::StdinInput;
use kittybridge::kitty::{CellGeometry, Personality};
use kittybridge::machine::TestCard;
use kittybridge::pacing::WallClock;
use kittybridge::queue::SampleQueue;
use kittybridge::sink::AudioSink;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PersonalityArg {
    /// retransmit replaces the image straight away (kitty)
    Immediate,
    /// retransmit, then animate to the new frame
    Animated,
}

impl From<PersonalityArg> for Personality {
    fn from(arg: PersonalityArg) -> Self {
        match arg {
            PersonalityArg::Immediate => Personality::Immediate,
            PersonalityArg::Animated => Personality::Animated,
        }
    }
}

/// Run an emulator in a terminal, using the kitty graphics protocol for
/// video and the default sound card for audio
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Program image to load once the machine has booted
    program: Option<PathBuf>,

    /// How the terminal wants image updates delivered
    #[arg(long, value_enum, default_value_t = PersonalityArg::Immediate)]
    personality: PersonalityArg,

    /// Don't open the sound card
    #[arg(long)]
    no_audio: bool,

    /// Image id to use instead of a random one
    #[arg(long)]
    image_id: Option<u32>,

    /// Terminal columns covered by the image
    #[arg(long, default_value_t = 30)]
    cols: u16,

    /// Terminal rows covered by the image
    #[arg(long, default_value_t = 10)]
    rows: u16,

    /// Frame at which the program image gets loaded
    #[arg(long, default_value_t = kittybridge::config::DEFAULT_LOAD_FRAME)]
    load_frame: u64,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Write logs here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config {
            personality: self.personality.into(),
            cells: CellGeometry {
                cols: self.cols,
                rows: self.rows,
            },
            image_id: self.image_id,
            program: self.program.clone(),
            load_frame: self.load_frame,
            max_frames: self.frames,
            ..Config::default()
        };
        config.audio.enabled = !self.no_audio;
        config
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    // stdout carries the image protocol, so logs never go there
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn run(config: &Config) -> anyhow::Result<RunStats> {
    let queue = Arc::new(SampleQueue::default());
    let sink = AudioSink::open(&config.audio, queue).context("audio initialisation failed")?;

    let (width, height) = config.screen;
    let mut machine = TestCard::new(width, height, sink.format().sample_rate);
    let mut display = KittyDisplay::new(io::stdout(), config.session(), config.personality, config.cells);

    println!("Screen {}x{}, image id {}", width, height, display.session());
    println!("Emulator started. Press 'ESC' to quit.");

    // raw mode lasts as long as `input`
    let mut input = StdinInput::new().context("cannot put the terminal in raw mode")?;
    let mut emulator = Emulator::new(
        &mut machine,
        &mut display,
        &mut input,
        Some(sink),
        WallClock::new(),
        config,
    );
    Ok(emulator.run()?)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let stats = run(&args.config())?;

    // get the shell prompt clear of the last frame
    println!();
    println!(
        "Emulator terminated after {} frames ({} dropped).",
        stats.frames, stats.dropped_frames
    );
    Ok(())
}
