//! camera_probe - try every connection strategy against one camera and report
//!
//! Runs the same ordered strategy list the acquisition worker uses, reading a
//! probe frame (plus a few more to estimate the rate) for each strategy.
//! Exits non-zero when no strategy yields a frame.

use anyhow::{anyhow, Result};
use clap::{ArgGroup, Parser};
use std::time::{Duration, Instant};

use camfuse::config::{CameraSource, SourceKind};
use camfuse::ingest::{open_with_probe, snapshot_url, strategies_for, SystemConnector, Timeouts};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a camera with every connection strategy")]
#[command(group(ArgGroup::new("target").required(true).args(["device", "url"])))]
struct Args {
    /// Local device index (e.g. 0 for /dev/video0).
    #[arg(long)]
    device: Option<u32>,

    /// Stream URL (rtsp://, http://, stub://, or a bare host:port).
    #[arg(long)]
    url: Option<String>,

    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 2000)]
    read_timeout_ms: u64,

    /// Extra frames to read after the probe frame.
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Stop at the first working strategy, as the worker does.
    #[arg(long)]
    first: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let source = match (args.device, &args.url) {
        (Some(index), _) => CameraSource::device("probe", "probe", index, true),
        (None, Some(url)) => CameraSource::stream("probe", "probe", url, true),
        (None, None) => return Err(anyhow!("either --device or --url is required")),
    };
    let timeouts = Timeouts {
        connect: Duration::from_millis(args.connect_timeout_ms),
        read: Duration::from_millis(args.read_timeout_ms),
    };

    println!("probing {}", source.address());
    if let SourceKind::Stream(url) = source.kind() {
        match snapshot_url(url) {
            Some(snapshot) => println!("snapshot url: {}", snapshot),
            None => println!("snapshot url: n/a"),
        }
    }

    let mut connector = SystemConnector::new();
    let mut working = Vec::new();
    for (n, strategy) in strategies_for(source.kind()).iter().enumerate() {
        let started = Instant::now();
        match open_with_probe(&mut connector, &source, *strategy, timeouts) {
            Ok((mut reader, probe)) => {
                let opened_in = started.elapsed();
                let read_started = Instant::now();
                let mut read = 0u32;
                let mut errors = 0u32;
                for _ in 0..args.frames {
                    match reader.read_frame() {
                        Ok(_) => read += 1,
                        Err(_) => errors += 1,
                    }
                }
                let elapsed = read_started.elapsed().as_secs_f64();
                let fps = if read > 0 && elapsed > 0.0 {
                    format!("{:.1} fps", f64::from(read) / elapsed)
                } else {
                    "rate n/a".to_string()
                };
                println!(
                    "#{} {:<16} OK   {}x{} in {:?}, {}/{} frames ({} errors), {}",
                    n + 1,
                    strategy,
                    probe.width,
                    probe.height,
                    opened_in,
                    read,
                    args.frames,
                    errors,
                    fps
                );
                working.push(*strategy);
                if args.first {
                    break;
                }
            }
            Err(err) => {
                println!("#{} {:<16} FAIL {}", n + 1, strategy, err);
            }
        }
    }

    match working.first() {
        Some(strategy) => {
            println!("worker would stream with: {}", strategy);
            Ok(())
        }
        None => Err(anyhow!("no connection strategy produced a frame")),
    }
}
