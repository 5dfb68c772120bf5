use std::fs::File;
use std::io::{stdin, BufRead};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam::channel;
use tracing::Level;

use chime::backend;
use chime::config::{BackendKind, Config};
use chime::control::{self, Command, Controls};
use chime::seq::Sequencer;
use chime::source::MetricSource;
use chime::tui::{self, UiState};

/// Plays a metric stream as MIDI notes.
#[derive(Parser, Debug)]
#[command(name = "chime", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, default_value = "config/chime.yml")]
    config: PathBuf,

    /// Read text commands from stdin instead of drawing the terminal UI
    #[arg(long)]
    headless: bool,

    /// Where logs go while the terminal UI owns the screen
    #[arg(long, default_value = "chime.log")]
    log: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    /// Overrides `midi.backend` from the configuration
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = tracing_subscriber::fmt().with_max_level(level);
    if args.headless {
        subscriber.with_writer(std::io::stderr).init();
    } else {
        let file = File::create(&args.log)
            .with_context(|| format!("creating log file {}", args.log.display()))?;
        subscriber
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

/// Forwards stdin lines as commands. End of input leaves the sequencer
/// running; `quit` stops it.
fn spawn_stdin_commands(controls: Controls) {
    thread::spawn(move || {
        for line in stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!("Reading stdin failed: {}", err);
                    return;
                }
            };
            if let Some(command) = control::parse_command(&line) {
                let done = command == Command::Shutdown;
                if controls.send(command).is_err() || done {
                    return;
                }
            }
        }
    });
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = Config::load(&args.config)?;
    if let Some(backend) = args.backend {
        config.midi.backend = backend;
    }

    let mut sequencer = Sequencer::new(&config.sequencer)?;
    let scale_names: Vec<String> = sequencer.scales().names().map(str::to_owned).collect();

    let (midi_tx, midi_rx) = channel::bounded(config.midi.queue_size);
    let backend = backend::open(&config.midi, midi_rx)?;

    let (value_tx, value_rx) = channel::bounded(256);
    let (command_tx, command_rx) = channel::bounded(64);
    let (report_tx, report_rx) = channel::bounded(256);
    if args.headless {
        drop(report_tx);
    } else {
        sequencer = sequencer.with_reports(report_tx);
    }
    let sequencer = thread::spawn(move || sequencer.run(value_rx, command_rx, midi_tx));

    let mut source = MetricSource::spawn(&config.source, value_tx)?;
    let controls = Controls::new(command_tx.clone(), Some(source.control()));
    tracing::info!("chime started");

    let ui = if args.headless {
        spawn_stdin_commands(controls);
        if source.is_finite() {
            source.wait();
            command_tx.send(Command::Shutdown).ok();
        }
        Ok(())
    } else {
        let ui = tui::run(
            UiState::new(&config.sequencer, scale_names),
            controls,
            report_rx,
        );
        command_tx.send(Command::Shutdown).ok();
        ui
    };

    let joined = sequencer
        .join()
        .map_err(|_| anyhow!("sequencer thread panicked"));
    source.stop();
    backend.shutdown()?;
    joined?;
    ui?;
    tracing::info!("chime stopped");
    Ok(())
}
