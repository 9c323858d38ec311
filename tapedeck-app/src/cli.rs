//! Command-line parsing.
//!
//! Hand-rolled: the surface is small and every value maps straight onto a
//! core type's `FromStr`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tapedeck_core::{BitDepth, Waveform};

pub const USAGE: &str = "\
Usage: tapedeck [global options] <command> [options]

Commands:
  record [--output <file.wav>] [--duration <secs>]
  play <file.wav> [--loop] [--resample] [--duration <secs>]
  tone [--waveform sine|square|triangle|saw] [--freq <hz>] [--amp <0..1>] [--duration <secs>]
  generate <file.wav> [--waveform ..] [--freq <hz>] [--amp <0..1>] [--duration <secs>]
           [--silence-ms <ms>] [--rate <hz>] [--channels <n>]
  ports
  settings [--save]

Global options:
  --host <name>          audio host (default host when omitted; e.g. jack, alsa)
  --device <name>        preferred input (record) or output (play/tone) device
  --channels <n>         recorded channel count
  --bit-depth <16|24|float>
  --gain <linear>        input gain for recordings
  --queue <blocks>       handoff queue capacity
  --block-size <frames>  fixed device block size
  --settings <file>      settings file (default: XDG data dir)
  --offline              use the simulated backend instead of a sound card
  -h, --help

Interactive keys (record/play/tone):
  start | stop | <Enter> toggle, p pause/resume, l ports, c connections,
  i info, q quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Record {
        output: Option<PathBuf>,
        duration: Option<Duration>,
    },
    Play {
        path: PathBuf,
        looping: bool,
        resample: bool,
        duration: Option<Duration>,
    },
    Tone(ToneArgs),
    Generate {
        output: PathBuf,
        tone: ToneArgs,
        silence_ms: u64,
        rate: u32,
        channels: u16,
    },
    Ports,
    Settings {
        save: bool,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToneArgs {
    pub waveform: Waveform,
    pub frequency: f32,
    pub amplitude: f32,
    pub duration: Option<Duration>,
}

impl Default for ToneArgs {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            frequency: 440.0,
            amplitude: 0.3,
            duration: None,
        }
    }
}

/// Options that override settings for this run only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub host: Option<String>,
    pub device: Option<String>,
    pub channels: Option<u16>,
    pub bit_depth: Option<BitDepth>,
    pub gain: Option<f32>,
    pub queue_capacity: Option<usize>,
    pub block_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub command: Command,
    pub overrides: Overrides,
    pub settings_path: Option<PathBuf>,
    pub offline: bool,
}

pub fn parse_args<I>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut it = args.into_iter().peekable();
    let mut overrides = Overrides::default();
    let mut settings_path = None;
    let mut offline = false;
    let mut command_name: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();

    // Command-specific flags, collected before the command is built.
    let mut output: Option<PathBuf> = None;
    let mut duration: Option<Duration> = None;
    let mut looping = false;
    let mut resample = false;
    let mut save = false;
    let mut tone = ToneArgs::default();
    let mut silence_ms = 0u64;
    let mut rate = 48_000u32;
    let mut help = false;

    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| anyhow!("missing value for {name}"));
        match arg.as_str() {
            "-h" | "--help" => help = true,
            "--offline" => offline = true,
            "--host" => overrides.host = Some(value("--host")?),
            "--device" => overrides.device = Some(value("--device")?),
            "--channels" => overrides.channels = Some(parse_num(&value("--channels")?, "--channels")?),
            "--bit-depth" => overrides.bit_depth = Some(value("--bit-depth")?.parse()?),
            "--gain" => overrides.gain = Some(parse_num(&value("--gain")?, "--gain")?),
            "--queue" => overrides.queue_capacity = Some(parse_num(&value("--queue")?, "--queue")?),
            "--block-size" => {
                overrides.block_size = Some(parse_num(&value("--block-size")?, "--block-size")?)
            }
            "--settings" => settings_path = Some(PathBuf::from(value("--settings")?)),
            "--output" | "-o" => output = Some(PathBuf::from(value("--output")?)),
            "--duration" | "-d" => duration = Some(parse_secs(&value("--duration")?)?),
            "--loop" => looping = true,
            "--resample" => resample = true,
            "--save" => save = true,
            "--waveform" | "-w" => tone.waveform = value("--waveform")?.parse()?,
            "--freq" | "-f" => tone.frequency = parse_num(&value("--freq")?, "--freq")?,
            "--amp" | "-a" => tone.amplitude = parse_num(&value("--amp")?, "--amp")?,
            "--silence-ms" => silence_ms = parse_num(&value("--silence-ms")?, "--silence-ms")?,
            "--rate" => rate = parse_num(&value("--rate")?, "--rate")?,
            flag if flag.starts_with('-') && flag.len() > 1 => bail!("unknown option: {flag}"),
            word => match command_name {
                None => command_name = Some(word.to_string()),
                Some(_) => positional.push(word.to_string()),
            },
        }
    }

    if !(tone.frequency.is_finite() && tone.frequency > 0.0) {
        bail!("--freq must be a positive number of hertz");
    }
    if rate == 0 {
        bail!("--rate must be positive");
    }
    tone.duration = duration;

    let command = match (help, command_name.as_deref()) {
        (true, _) | (false, None) => Command::Help,
        (false, Some("record" | "rec")) => Command::Record { output, duration },
        (false, Some("play")) => Command::Play {
            path: take_path(&mut positional, "play")?,
            looping,
            resample,
            duration,
        },
        (false, Some("tone")) => Command::Tone(tone),
        (false, Some("generate" | "gen")) => {
            let output = match output {
                Some(path) => path,
                None => take_path(&mut positional, "generate")?,
            };
            Command::Generate {
                output,
                tone,
                silence_ms,
                rate,
                channels: overrides.channels.unwrap_or(1),
            }
        }
        (false, Some("ports" | "list")) => Command::Ports,
        (false, Some("settings")) => Command::Settings { save },
        (false, Some(other)) => bail!("unknown command: {other}"),
    };

    if let Some(extra) = positional.first() {
        bail!("unexpected argument: {extra}");
    }

    Ok(Cli {
        command,
        overrides,
        settings_path,
        offline,
    })
}

fn take_path(positional: &mut Vec<String>, command: &str) -> Result<PathBuf> {
    if positional.is_empty() {
        bail!("{command} needs a WAV file path");
    }
    Ok(PathBuf::from(positional.remove(0)))
}

fn parse_num<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("invalid value for {name}: {raw}"))
}

fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: f64 = parse_num(raw, "--duration")?;
    Duration::try_from_secs_f64(secs).context("--duration must be a non-negative number of seconds")
}
