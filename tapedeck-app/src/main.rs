//! `tapedeck`: record to and play from WAV files through the audio callback
//! hand-off in `tapedeck-core`.
//!
//! ## Runtime note
//!
//! The audio path is plain threads. Tokio only appears as a small
//! current-thread runtime that forwards Ctrl+C and session broadcasts into
//! the interactive loop (see `commands::spawn_event_forwarder`).

mod cli;
mod commands;
mod settings;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cli::{parse_args, Command, USAGE};
use settings::{default_settings_path, load_settings, AppSettings};
use state::{AppState, Plan};
use tapedeck_core::{
    AudioBackend, AudioSession, CpalBackend, SimulatedBackend, SimulatedConfig, SourceBuffer,
};
use tracing::{error, info};

/// Block size the offline backend delivers when none is configured.
const OFFLINE_BLOCK: usize = 256;
const OFFLINE_RATE: u32 = 48_000;

fn build_backend(settings: &AppSettings, offline: bool) -> Arc<dyn AudioBackend> {
    if offline {
        let block = settings.block_size.map_or(OFFLINE_BLOCK, |b| b as usize);
        info!(block, "using the simulated backend");
        Arc::new(SimulatedBackend::new(SimulatedConfig {
            sample_rate: OFFLINE_RATE,
            channels: settings.channels,
            block_sizes: vec![block],
            // Pace the clock like a real device.
            pace: Duration::from_secs_f64(block as f64 / OFFLINE_RATE as f64),
            record_output: false,
            ..Default::default()
        }))
    } else {
        Arc::new(CpalBackend::new(settings.host.clone()))
    }
}

fn run_live(
    plan: Plan,
    deadline: Option<Duration>,
    settings: AppSettings,
    settings_path: PathBuf,
    offline: bool,
) -> Result<()> {
    let backend = build_backend(&settings, offline);
    let session = AudioSession::new(settings.session_config(), backend)
        .context("invalid session configuration")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    commands::spawn_event_forwarder(&session, tx.clone())?;
    commands::spawn_input_reader(tx)?;

    let mut state = AppState::new(session, plan, settings, settings_path);
    commands::run_session(&mut state, &rx, deadline)
}

fn run() -> Result<()> {
    let cli = parse_args(std::env::args().skip(1))?;

    let settings_path = cli
        .settings_path
        .clone()
        .unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    let playback = matches!(cli.command, Command::Play { .. } | Command::Tone(_));
    settings.apply_cli(&cli.overrides, playback);
    info!(
        settings_path = %settings_path.display(),
        host = settings.host.as_deref().unwrap_or("default"),
        queue_capacity = settings.queue_capacity,
        bit_depth = %settings.bit_depth,
        "settings loaded"
    );

    match cli.command {
        Command::Help => {
            println!("{USAGE}");
            Ok(())
        }
        Command::Settings { save } => commands::show_settings(&settings, &settings_path, save),
        Command::Ports => {
            let ports = build_backend(&settings, cli.offline).list_ports()?;
            commands::print_ports(&ports);
            Ok(())
        }
        Command::Generate {
            output,
            tone,
            silence_ms,
            rate,
            channels,
        } => commands::generate(&output, &tone, silence_ms, rate, channels, &settings),
        Command::Record { output, duration } => run_live(
            Plan::Record { output },
            duration,
            settings,
            settings_path,
            cli.offline,
        ),
        Command::Play {
            path,
            looping,
            resample,
            duration,
        } => {
            settings.resample_to_device |= resample;
            let buffer = SourceBuffer::from_wav(&path)
                .with_context(|| format!("cannot play {}", path.display()))?;
            info!(
                path = %path.display(),
                channels = buffer.channels(),
                sample_rate = buffer.sample_rate(),
                secs = format_args!("{:.2}", buffer.duration_secs()),
                "source loaded"
            );
            run_live(
                Plan::PlayFile {
                    path,
                    buffer: Arc::new(buffer),
                    looping,
                },
                duration,
                settings,
                settings_path,
                cli.offline,
            )
        }
        Command::Tone(tone) => run_live(
            Plan::Tone {
                waveform: tone.waveform,
                frequency: tone.frequency,
                amplitude: tone.amplitude,
                secs: tone.duration.map(|d| d.as_secs_f64()),
            },
            None,
            settings,
            settings_path,
            cli.offline,
        ),
    }
}

fn main() -> ExitCode {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tapedeck=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
