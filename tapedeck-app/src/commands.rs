//! Command handlers for the `tapedeck` binary.
//!
//! One-shot commands (`ports`, `generate`, `settings`) run and return.
//! `record`, `play` and `tone` start a take and then run the interactive loop,
//! which multiplexes three inputs on one crossbeam channel:
//!
//! ```text
//! stdin lines ──────────────┐
//! Ctrl+C (tokio::signal) ───┼──► AppEvent ──► run_session() ──► AudioSession
//! session broadcasts ───────┘
//! ```

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{select, Receiver, Sender};
use tapedeck_core::{
    AudioSession, FinishedEvent, LevelEvent, PortInfo, SessionEnd, SessionMode, SessionReport,
    SessionStatus, SessionStatusEvent, SignalBuffer, Transition,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::ToneArgs;
use crate::settings::{save_settings, AppSettings};
use crate::state::AppState;

/// Everything the interactive loop reacts to.
#[derive(Debug)]
pub enum AppEvent {
    Line(String),
    InputClosed,
    Interrupt,
    Status(SessionStatusEvent),
    Level(LevelEvent),
    Finished(FinishedEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Toggle,
    Pause,
    Ports,
    Connections,
    Info,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_action(line: &str) -> Action {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Action::Toggle,
        "start" | "s" => Action::Start,
        "stop" | "x" => Action::Stop,
        "p" | "pause" | "resume" => Action::Pause,
        "l" | "ports" => Action::Ports,
        "c" | "connections" => Action::Connections,
        "i" | "info" => Action::Info,
        "h" | "help" | "?" => Action::Help,
        "q" | "quit" | "exit" => Action::Quit,
        other => Action::Unknown(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

const KEYS: &str = "keys: start | stop | <Enter> toggle | p pause | l ports | c connections | i info | q quit";

// ── Event sources ──────────────────────────────────────────────────────────

/// Forward stdin lines until EOF.
pub fn spawn_input_reader(tx: Sender<AppEvent>) -> Result<()> {
    thread::Builder::new()
        .name("tapedeck-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(AppEvent::Line(line)).is_err() {
                    return;
                }
            }
            let _ = tx.send(AppEvent::InputClosed);
        })
        .context("failed to spawn stdin reader")?;
    Ok(())
}

/// Forward Ctrl+C and the session's broadcasts on a small current-thread
/// runtime. Ends when the session (and with it every sender) is dropped.
pub fn spawn_event_forwarder(session: &AudioSession, tx: Sender<AppEvent>) -> Result<()> {
    let mut status = session.subscribe_status();
    let mut levels = session.subscribe_levels();
    let mut finished = session.subscribe_finished();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build event runtime")?;

    thread::Builder::new()
        .name("tapedeck-events".into())
        .spawn(move || {
            runtime.block_on(async move {
                let ctrl_c = tokio::signal::ctrl_c();
                tokio::pin!(ctrl_c);
                let mut interrupted = false;
                loop {
                    let event = tokio::select! {
                        res = &mut ctrl_c, if !interrupted => {
                            interrupted = true;
                            match res {
                                Ok(()) => AppEvent::Interrupt,
                                Err(e) => {
                                    warn!("Ctrl+C handler unavailable: {e}");
                                    continue;
                                }
                            }
                        }
                        ev = status.recv() => match ev {
                            Ok(ev) => AppEvent::Status(ev),
                            Err(RecvError::Lagged(n)) => {
                                debug!(skipped = n, "status events lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => break,
                        },
                        ev = levels.recv() => match ev {
                            Ok(ev) => AppEvent::Level(ev),
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        },
                        ev = finished.recv() => match ev {
                            Ok(ev) => AppEvent::Finished(ev),
                            Err(RecvError::Lagged(_)) => continue,
                            Err(RecvError::Closed) => break,
                        },
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
        })
        .context("failed to spawn event forwarder")?;
    Ok(())
}

// ── Interactive loop ───────────────────────────────────────────────────────

/// Start the first take, then serve commands until quit, Ctrl+C, the
/// optional `deadline`, or a playback source running out.
pub fn run_session(
    state: &mut AppState,
    events: &Receiver<AppEvent>,
    deadline: Option<Duration>,
) -> Result<()> {
    println!("{}", state.plan.describe());
    println!("{KEYS}");
    start_take(state)?;

    let timeout = deadline.map_or_else(crossbeam_channel::never, crossbeam_channel::after);
    loop {
        select! {
            recv(events) -> ev => {
                let Ok(ev) = ev else { break };
                if handle_event(state, ev)? == Flow::Quit {
                    break;
                }
            }
            recv(timeout) -> _ => {
                info!("requested duration reached");
                break;
            }
        }
    }

    if state.session.state() != SessionStatus::Idle {
        stop_take(state)?;
    }
    Ok(())
}

fn handle_event(state: &mut AppState, event: AppEvent) -> Result<Flow> {
    match event {
        AppEvent::Line(line) => Ok(handle_action(state, parse_action(&line))),
        AppEvent::InputClosed => {
            debug!("stdin closed; waiting for the take to end or Ctrl+C");
            Ok(Flow::Continue)
        }
        AppEvent::Interrupt => {
            println!("interrupted");
            Ok(Flow::Quit)
        }
        AppEvent::Status(ev) => {
            debug!(status = ?ev.status, detail = ?ev.detail, "session status");
            if ev.status == SessionStatus::Idle && ev.detail.is_some() {
                handle_unsolicited_end(state)
            } else {
                Ok(Flow::Continue)
            }
        }
        AppEvent::Level(ev) => {
            if state.settings.show_levels {
                eprintln!(
                    "level {:>6.1} dBFS   peak {:>6.1} dBFS",
                    dbfs(ev.rms),
                    dbfs(ev.peak)
                );
            }
            state.last_level = Some(ev);
            Ok(Flow::Continue)
        }
        AppEvent::Finished(ev) => {
            println!(
                "source finished after {} frames ({} frames of silence)",
                ev.frames_played, ev.silence_frames
            );
            Ok(Flow::Continue)
        }
    }
}

fn handle_action(state: &mut AppState, action: Action) -> Flow {
    let result = match action {
        Action::Start => start_take(state),
        Action::Stop => stop_take(state).map(|_| ()),
        Action::Toggle => {
            if state.session.state() == SessionStatus::Idle {
                start_take(state)
            } else {
                stop_take(state).map(|_| ())
            }
        }
        Action::Pause => {
            match state.session.toggle_pause() {
                Transition::Paused => println!("paused"),
                Transition::Resumed => println!("resumed"),
                _ => println!("not running"),
            }
            Ok(())
        }
        Action::Ports => state
            .session
            .list_ports()
            .map(|ports| print_ports(&ports))
            .map_err(Into::into),
        Action::Connections => {
            print_connections(&state.session);
            Ok(())
        }
        Action::Info => print_info(state),
        Action::Help => {
            println!("{KEYS}");
            Ok(())
        }
        Action::Quit => return Flow::Quit,
        Action::Unknown(cmd) => {
            println!("unknown command '{cmd}'");
            println!("{KEYS}");
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
    }
    Flow::Continue
}

/// A take ended without a stop command: device loss, end of source or a
/// failed write.
fn handle_unsolicited_end(state: &mut AppState) -> Result<Flow> {
    // A newer take may already be running; the event belongs to the old one.
    if state.session.state() == SessionStatus::Active {
        return Ok(Flow::Continue);
    }
    let Some(report) = collect_finished(&state.session)? else {
        return Ok(Flow::Continue);
    };
    print_report(&report);
    match report.end {
        SessionEnd::EndOfStream => Ok(Flow::Quit),
        SessionEnd::Disconnected => {
            eprintln!("audio device disconnected; 'start' to try again, 'q' to quit");
            Ok(Flow::Continue)
        }
        SessionEnd::Requested | SessionEnd::WriteFailed => Ok(Flow::Continue),
    }
}

/// Join a worker that ended by itself and return its report or error.
fn collect_finished(session: &AudioSession) -> Result<Option<SessionReport>> {
    match session.stop()? {
        Transition::Stopped(report) => Ok(Some(report)),
        _ => Ok(session.take_finished().transpose()?),
    }
}

fn start_take(state: &mut AppState) -> Result<()> {
    let transition = if state.plan.is_playback() {
        let source = state.playback_source()?;
        state.session.start_playback(source)
    } else {
        state.session.start_capture(state.capture_target())
    };

    match transition? {
        Transition::Started(info) => {
            state.takes += 1;
            let verb = if state.plan.is_playback() {
                "playing"
            } else {
                "recording"
            };
            println!(
                "{verb} on {} [{}] at {} Hz, {} ch",
                info.device, info.host, info.sample_rate, info.channels
            );
            if let Some(target) = state.session.description() {
                println!("  {target}");
            }
        }
        Transition::AlreadyRunning => println!("already running"),
        _ => {}
    }
    Ok(())
}

fn stop_take(state: &mut AppState) -> Result<Option<SessionReport>> {
    match state.session.stop()? {
        Transition::Stopped(report) => {
            print_report(&report);
            Ok(Some(report))
        }
        _ => {
            println!("not running");
            Ok(None)
        }
    }
}

// ── Output ─────────────────────────────────────────────────────────────────

fn dbfs(linear: f32) -> f32 {
    20.0 * linear.max(1e-6).log10()
}

fn print_report(report: &SessionReport) {
    let diag = &report.diagnostics;
    match report.mode {
        SessionMode::Capture => {
            if let Some(rec) = &report.recording {
                let secs = rec.frames as f64 / rec.sample_rate.max(1) as f64;
                match &rec.path {
                    Some(path) => println!(
                        "saved {} ({} frames, {secs:.2}s, {} ch @ {} Hz)",
                        path.display(),
                        rec.frames,
                        rec.channels,
                        rec.sample_rate
                    ),
                    None => println!("captured {} frames ({secs:.2}s)", rec.frames),
                }
            }
            if diag.blocks_dropped > 0 || diag.write_errors > 0 {
                println!(
                    "  {} of {} blocks dropped, {} write errors",
                    diag.blocks_dropped, diag.blocks_captured, diag.write_errors
                );
            }
        }
        SessionMode::Playback => println!(
            "played {} frames ({:.2}s)",
            diag.frames_played,
            diag.frames_played as f64 / report.stream.sample_rate.max(1) as f64
        ),
    }
    if report.end != SessionEnd::Requested {
        println!("  ended: {}", report.end);
    }
}

pub fn print_ports(ports: &[PortInfo]) {
    if ports.is_empty() {
        println!("no audio devices found");
        return;
    }
    for port in ports {
        let channels = port
            .channels
            .map_or_else(|| "?".to_string(), |c| c.to_string());
        let rate = port
            .sample_rate
            .map_or_else(|| "?".to_string(), |r| r.to_string());
        println!(
            "{:<8} {} {}  ({channels} ch, {rate} Hz)",
            port.direction,
            if port.is_default { "*" } else { " " },
            port.name
        );
    }
}

fn print_connections(session: &AudioSession) {
    match session.connections() {
        Some(info) => println!(
            "{} {} on {} [{}]: {} Hz, {} ch, block {}",
            session.config().client_name,
            info.direction,
            info.device,
            info.host,
            info.sample_rate,
            info.channels,
            info.block_size
                .map_or_else(|| "host default".to_string(), |b| b.to_string())
        ),
        None => println!("no active connection"),
    }
}

fn print_info(state: &AppState) -> Result<()> {
    let session = &state.session;
    println!("host:      {}", session.host_name());
    println!("plan:      {}", state.plan.describe());
    println!("state:     {:?}", session.state());
    println!("takes:     {}", state.takes);
    if let Some(target) = session.description() {
        println!("target:    {target}");
    }
    if let Some(progress) = session.progress() {
        let total = progress
            .total_frames
            .map(|t| format!(" / {:.2}s", t as f64 / progress.sample_rate.max(1) as f64))
            .unwrap_or_default();
        println!(
            "position:  {:.2}s{total}{}",
            progress.position_secs(),
            if progress.paused { " (paused)" } else { "" }
        );
    }
    if let Some(level) = &state.last_level {
        println!("level:     {:.1} dBFS (peak {:.1})", dbfs(level.rms), dbfs(level.peak));
    }
    println!(
        "counters:  {}",
        serde_json::to_string(&session.diagnostics_snapshot())?
    );
    println!("settings:  {}", state.settings_path.display());
    Ok(())
}

// ── One-shot commands ──────────────────────────────────────────────────────

/// Render a tone (plus optional trailing silence) straight to a WAV file.
pub fn generate(
    output: &Path,
    tone: &ToneArgs,
    silence_ms: u64,
    rate: u32,
    channels: u16,
    settings: &AppSettings,
) -> Result<()> {
    let secs = tone.duration.map_or(1.0, |d| d.as_secs_f64());
    let summary = SignalBuffer::new(rate, channels)
        .with_tone(tone.waveform, tone.frequency, tone.amplitude, secs)
        .with_silence(silence_ms)
        .write_wav(output, settings.bit_depth)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(
        path = %output.display(),
        frames = summary.frames,
        "generated signal written"
    );
    println!(
        "wrote {} ({} frames, {} ch @ {} Hz, {})",
        output.display(),
        summary.frames,
        summary.channels,
        summary.sample_rate,
        settings.bit_depth
    );
    Ok(())
}

pub fn show_settings(settings: &AppSettings, path: &Path, save: bool) -> Result<()> {
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(settings)?);
    if save {
        save_settings(path, settings)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("saved");
    }
    io::stdout().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Plan;
    use std::sync::Arc;
    use tapedeck_core::{SimulatedBackend, SimulatedConfig, Waveform};

    fn offline_state(plan: Plan, dir: &Path) -> AppState {
        let settings = AppSettings {
            recordings_dir: Some(dir.to_path_buf()),
            pop_timeout_ms: 10,
            show_levels: false,
            ..Default::default()
        };
        let backend = SimulatedBackend::new(SimulatedConfig {
            pace: Duration::from_micros(200),
            ..Default::default()
        });
        let session = AudioSession::new(settings.session_config(), Arc::new(backend)).unwrap();
        AppState::new(session, plan, settings, dir.join("settings.json"))
    }

    #[test]
    fn actions_parse_short_and_long_forms() {
        assert_eq!(parse_action(""), Action::Toggle);
        assert_eq!(parse_action("  START "), Action::Start);
        assert_eq!(parse_action("x"), Action::Stop);
        assert_eq!(parse_action("p"), Action::Pause);
        assert_eq!(parse_action("l"), Action::Ports);
        assert_eq!(parse_action("c"), Action::Connections);
        assert_eq!(parse_action("i"), Action::Info);
        assert_eq!(parse_action("q"), Action::Quit);
        assert_eq!(parse_action("dance"), Action::Unknown("dance".into()));
    }

    #[test]
    fn dbfs_floors_silence() {
        assert_eq!(dbfs(1.0), 0.0);
        assert!((dbfs(0.5) + 6.02).abs() < 0.01);
        assert_eq!(dbfs(0.0), -120.0);
    }

    #[test]
    fn scripted_record_session_writes_two_takes() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("take.wav");
        let mut state = offline_state(
            Plan::Record {
                output: Some(first.clone()),
            },
            dir.path(),
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        for line in ["stop", "", "i", "stop", "q"] {
            tx.send(AppEvent::Line(line.into())).unwrap();
        }

        run_session(&mut state, &rx, None).unwrap();

        assert_eq!(state.takes, 2);
        assert!(first.exists());
        assert!(dir.path().join("take_2.wav").exists());
        assert_eq!(state.session.state(), SessionStatus::Idle);
    }

    #[test]
    fn deadline_stops_the_take() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = offline_state(Plan::Record { output: None }, dir.path());
        let (_tx, rx) = crossbeam_channel::unbounded();

        run_session(&mut state, &rx, Some(Duration::from_millis(30))).unwrap();

        assert_eq!(state.session.state(), SessionStatus::Idle);
        let recordings = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(recordings, 1);
    }

    #[test]
    fn tone_session_quits_when_the_source_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = offline_state(
            Plan::Tone {
                waveform: Waveform::Triangle,
                frequency: 220.0,
                amplitude: 0.2,
                secs: Some(0.05),
            },
            dir.path(),
        );
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_event_forwarder(&state.session, tx).unwrap();

        run_session(&mut state, &rx, Some(Duration::from_secs(10))).unwrap();

        assert_eq!(state.session.state(), SessionStatus::Idle);
        assert_eq!(state.session.diagnostics_snapshot().frames_played, 2_400);
    }

    #[test]
    fn generate_writes_tone_and_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sig.wav");
        let tone = ToneArgs {
            duration: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        generate(&path, &tone, 50, 8_000, 1, &AppSettings::default()).unwrap();
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 1_200);
    }
}
