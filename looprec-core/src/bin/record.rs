//! Command-line loopback recorder.
//!
//! ```text
//! record --list-devices
//! record --device "Stereo Mix" --out-dir recordings --split-secs 60 \
//!        --silence-dbfs -40 --silence-secs 2 --gain-db 12
//! ```
//!
//! Runs until Ctrl+C (or `--duration-secs`), printing level and segment
//! events as they arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use looprec_core::{
    audio::device::list_input_devices, AudioFormat, RecorderConfig, RecorderEngine, RecorderState,
    SilenceMetric,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "looprec_core=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("record failed: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct Args {
    list_devices: bool,
    device: Option<String>,
    out_dir: PathBuf,
    format: AudioFormat,
    split_secs: Option<u64>,
    silence_dbfs: Option<f32>,
    silence_secs: f32,
    gate_dbfs: Option<f32>,
    gain_db: f32,
    duration_secs: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        list_devices: false,
        device: None,
        out_dir: PathBuf::from("recordings"),
        format: AudioFormat::Wav,
        split_secs: None,
        silence_dbfs: None,
        silence_secs: 2.0,
        gate_dbfs: None,
        gain_db: 0.0,
        duration_secs: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--list-devices" => args.list_devices = true,
            "--device" => args.device = Some(value("--device")?),
            "--out-dir" => args.out_dir = PathBuf::from(value("--out-dir")?),
            "--format" => {
                args.format = match value("--format")?.as_str() {
                    "wav" => AudioFormat::Wav,
                    "flac" => AudioFormat::Flac,
                    "mp3" => AudioFormat::Mp3,
                    other => return Err(format!("unknown format: {other}")),
                };
            }
            "--split-secs" => {
                args.split_secs = Some(
                    value("--split-secs")?
                        .parse()
                        .map_err(|_| "invalid value for --split-secs".to_string())?,
                );
            }
            "--silence-dbfs" => {
                args.silence_dbfs = Some(
                    value("--silence-dbfs")?
                        .parse()
                        .map_err(|_| "invalid value for --silence-dbfs".to_string())?,
                );
            }
            "--silence-secs" => {
                args.silence_secs = value("--silence-secs")?
                    .parse()
                    .map_err(|_| "invalid value for --silence-secs".to_string())?;
            }
            "--gate-dbfs" => {
                args.gate_dbfs = Some(
                    value("--gate-dbfs")?
                        .parse()
                        .map_err(|_| "invalid value for --gate-dbfs".to_string())?,
                );
            }
            "--gain-db" => {
                args.gain_db = value("--gain-db")?
                    .parse()
                    .map_err(|_| "invalid value for --gain-db".to_string())?;
            }
            "--duration-secs" => {
                args.duration_secs = Some(
                    value("--duration-secs")?
                        .parse()
                        .map_err(|_| "invalid value for --duration-secs".to_string())?,
                );
            }
            "--help" | "-h" => {
                println!(
                    "Usage: record [--list-devices] [--device <name>] [--out-dir <dir>] \\
  [--format wav|flac|mp3] [--split-secs <n>] [--silence-dbfs <db> [--silence-secs <s>]] \\
  [--gate-dbfs <db>] [--gain-db <db>] [--duration-secs <n>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("no input devices found");
        }
        for d in devices {
            let marks = [
                d.is_recommended.then_some("recommended"),
                d.is_loopback_like.then_some("loopback"),
                d.is_default.then_some("default"),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");
            if marks.is_empty() {
                println!("  {}", d.name);
            } else {
                println!("  {} [{marks}]", d.name);
            }
        }
        return Ok(());
    }

    let config = RecorderConfig {
        preferred_device: args.device,
        out_dir: args.out_dir,
        format: args.format,
        split_interval: args.split_secs.map(Duration::from_secs),
        silence_threshold_dbfs: args.silence_dbfs,
        silence_duration: Duration::from_secs_f32(args.silence_secs.max(0.1)),
        silence_metric: SilenceMetric::Peak,
        noise_gate_dbfs: args.gate_dbfs,
        gain_db: args.gain_db,
        ..RecorderConfig::default()
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let engine = Arc::new(RecorderEngine::new(config));
    let mut segments = engine.subscribe_segments();

    {
        let _guard = runtime.enter();
        engine.start().map_err(|e| e.to_string())?;
    }

    runtime.block_on(async {
        let deadline = args
            .duration_secs
            .map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        let mut ticker = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
                event = segments.recv() => {
                    if let Ok(event) = event {
                        println!(
                            "segment {:?}: {} ({:.1} s)",
                            event.stage,
                            event.path.display(),
                            event.duration_secs
                        );
                    }
                }
                _ = ticker.tick() => {
                    let snap = engine.snapshot();
                    if snap.state == RecorderState::Failed {
                        break;
                    }
                    let peak = snap
                        .levels
                        .iter()
                        .map(|l| l.peak_dbfs)
                        .fold(f32::NEG_INFINITY, f32::max);
                    print!(
                        "\r{:>8.1} s  peak {:>6.1} dBFS  overruns {}    ",
                        snap.elapsed_secs, peak, snap.overrun_blocks
                    );
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                    if let Some(deadline) = deadline {
                        if tokio::time::Instant::now() >= deadline {
                            println!();
                            break;
                        }
                    }
                }
            }
        }
    });

    {
        let _guard = runtime.enter();
        engine.stop().map_err(|e| e.to_string())?;
    }

    let diag = engine.diagnostics_snapshot();
    let snap = engine.snapshot();
    println!(
        "done: {} segment(s), {} frames written, {} overrun block(s)",
        diag.segments_closed, diag.frames_written, snap.overrun_blocks
    );
    Ok(())
}
