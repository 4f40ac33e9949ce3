//! Command line parsing

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub const USAGE: &str = "\
usage: twindeck-player <deck-a.wav> <bpm-a> <deck-b.wav> <bpm-b> [options]

options:
  --offline            drive the engine from the headless ticker, no device
  --bars <n>           bars to capture (default: recording ceiling)
  --loop-bars <n>      loop length on both decks (default: 4)
  --gate <pattern>     run gate pattern 0-7 on deck B
  --crossfader <0-100> crossfader position (default: 50)
  --out <file.wav>     capture destination
  --config <file>      engine config (default: ~/.config/twindeck/config.yaml)";

#[derive(Debug, Clone, PartialEq)]
pub struct DeckSource {
    pub path: PathBuf,
    pub bpm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub decks: [DeckSource; 2],
    pub offline: bool,
    pub bars: Option<u32>,
    pub loop_bars: f64,
    pub gate: Option<usize>,
    pub crossfader: f32,
    pub out: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl Options {
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut offline = false;
        let mut bars = None;
        let mut loop_bars = 4.0;
        let mut gate = None;
        let mut crossfader = 50.0;
        let mut out = None;
        let mut config = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--offline" => offline = true,
                "--bars" => bars = Some(number(&mut args, "--bars")?),
                "--loop-bars" => loop_bars = number(&mut args, "--loop-bars")?,
                "--gate" => gate = Some(number(&mut args, "--gate")?),
                "--crossfader" => crossfader = number(&mut args, "--crossfader")?,
                "--out" => out = Some(PathBuf::from(value(&mut args, "--out")?)),
                "--config" => config = Some(PathBuf::from(value(&mut args, "--config")?)),
                flag if flag.starts_with("--") => bail!("unknown option {}", flag),
                _ => positional.push(arg),
            }
        }

        let [path_a, bpm_a, path_b, bpm_b] = <[String; 4]>::try_from(positional)
            .map_err(|p| anyhow::anyhow!("expected 4 positional arguments, got {}", p.len()))?;

        Ok(Self {
            decks: [
                DeckSource { path: path_a.into(), bpm: parse_bpm(&bpm_a)? },
                DeckSource { path: path_b.into(), bpm: parse_bpm(&bpm_b)? },
            ],
            offline,
            bars,
            loop_bars,
            gate,
            crossfader,
            out,
            config,
        })
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next().with_context(|| format!("{} needs a value", flag))
}

fn number<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = value(args, flag)?;
    raw.parse().with_context(|| format!("invalid value for {}: {}", flag, raw))
}

fn parse_bpm(raw: &str) -> Result<f64> {
    let bpm: f64 = raw.parse().with_context(|| format!("invalid BPM: {}", raw))?;
    if !bpm.is_finite() || bpm <= 0.0 {
        bail!("BPM must be positive, got {}", raw);
    }
    Ok(bpm)
}
