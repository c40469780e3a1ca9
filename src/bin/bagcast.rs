//! bagcast CLI — convert a recorded MCAP log into per-camera video segments.
//!
//! Usage:
//!   bagcast <log.mcap> [options]
//!
//! Options:
//!   --topic <name>          Only process this topic (repeatable; default: all camera topics)
//!   --segment-dir <dir>     Write segments under this directory (default: ./segments)
//!   --fps <n>               Output frame rate (default: 30)
//!   --segment-secs <n>      Segment duration in seconds (default: 2)
//!   --bitrate <bps>         Encoder bitrate target (default: 2000000)
//!   --list                  List the log's topics and exit

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use bagcast::{Catalog, Driver, McapSource, SchemaKind, SegmentSettings, SegmentStore};

struct Args {
    log_path: String,
    topics: Vec<String>,
    segment_dir: PathBuf,
    fps: u32,
    segment_secs: u64,
    bitrate_bps: u32,
    list_only: bool,
}

fn parse_args() -> Option<Args> {
    let argv: Vec<String> = std::env::args().collect();
    let mut log_path: Option<String> = None;
    let mut topics: Vec<String> = Vec::new();
    let mut segment_dir = PathBuf::from("segments");
    let mut fps = 30u32;
    let mut segment_secs = 2u64;
    let mut bitrate_bps = 2_000_000u32;
    let mut list_only = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--topic" if i + 1 < argv.len() => {
                topics.push(argv[i + 1].clone());
                i += 2;
            }
            "--segment-dir" if i + 1 < argv.len() => {
                segment_dir = PathBuf::from(&argv[i + 1]);
                i += 2;
            }
            "--fps" if i + 1 < argv.len() => {
                fps = argv[i + 1].parse().unwrap_or(fps);
                i += 2;
            }
            "--segment-secs" if i + 1 < argv.len() => {
                segment_secs = argv[i + 1].parse().unwrap_or(segment_secs);
                i += 2;
            }
            "--bitrate" if i + 1 < argv.len() => {
                bitrate_bps = argv[i + 1].parse().unwrap_or(bitrate_bps);
                i += 2;
            }
            "--list" => {
                list_only = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                if log_path.is_none() && !other.starts_with("--") {
                    log_path = Some(other.to_string());
                }
                i += 1;
            }
        }
    }

    let log_path = match log_path {
        Some(p) => p,
        None => {
            print_usage();
            return None;
        }
    };

    Some(Args {
        log_path,
        topics,
        segment_dir,
        fps,
        segment_secs,
        bitrate_bps,
        list_only,
    })
}

fn print_usage() {
    println!("bagcast — convert a recorded MCAP log into per-camera video segments");
    println!();
    println!("Usage: bagcast <log.mcap> [options]");
    println!();
    println!("Options:");
    println!("  --topic <name>          Only process this topic (repeatable)");
    println!("  --segment-dir <dir>     Write segments under this directory (default: ./segments)");
    println!("  --fps <n>               Output frame rate (default: 30)");
    println!("  --segment-secs <n>      Segment duration in seconds (default: 2)");
    println!("  --bitrate <bps>         Encoder bitrate target (default: 2000000)");
    println!("  --list                  List the log's topics and exit");
    println!();
    println!("Examples:");
    println!("  bagcast drive.mcap");
    println!("  bagcast drive.mcap --topic /front/image/compressed --segment-dir out");
}

fn sanitize_topic(topic: &str) -> String {
    topic
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn schema_label(kind: SchemaKind) -> &'static str {
    match kind {
        SchemaKind::Image => "camera",
        SchemaKind::CameraInfo => "calibration",
        SchemaKind::PointCloud => "point cloud",
        SchemaKind::Unsupported => "unsupported",
    }
}

fn write_segments(store: &SegmentStore, dir: &Path) -> Result<(usize, u64)> {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for topic in store.topics() {
        let topic_dir = dir.join(sanitize_topic(topic));
        std::fs::create_dir_all(&topic_dir)
            .with_context(|| format!("creating {}", topic_dir.display()))?;
        for index in 0..store.segment_count(topic) {
            if let Some(segment) = store.get(topic, index) {
                let path = topic_dir.join(format!("{:05}.mp4", index));
                let mut file = std::fs::File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                file.write_all(&segment.data)?;
                files += 1;
                bytes += segment.len() as u64;
            }
        }
    }
    Ok((files, bytes))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bagcast=info".parse()?),
        )
        .init();

    let Some(args) = parse_args() else {
        std::process::exit(1);
    };

    let source = McapSource::open(&args.log_path)
        .with_context(|| format!("opening {}", args.log_path))?;
    let settings = SegmentSettings {
        fps: args.fps,
        segment_secs: args.segment_secs,
        bitrate_bps: args.bitrate_bps,
    };
    let mut catalog = Catalog::with_settings(Box::new(source), settings);
    catalog.set_include_topics(args.topics.clone());

    let topics = catalog.topics()?.to_vec();
    let duration_ns = catalog.duration_ns()?;

    println!();
    println!("========================================");
    println!("bagcast");
    println!("========================================");
    println!("Log:        {}", args.log_path);
    println!("Duration:   {:.1}s (incl. margin)", duration_ns as f64 / 1e9);
    for topic in &topics {
        println!("Topic:      {} ({})", topic.name, schema_label(topic.kind));
    }
    println!("========================================");
    println!();

    if args.list_only {
        return Ok(());
    }

    let plans = catalog.into_execution_plans()?;
    if plans.is_empty() {
        anyhow::bail!("no camera topics to process");
    }

    let started = Instant::now();
    let mut store = SegmentStore::new();
    Driver::new(plans).run(&mut store)?;
    let (files, bytes) = write_segments(&store, &args.segment_dir)?;

    println!();
    println!("========================================");
    println!("Segmenting complete");
    println!("========================================");
    let mut names: Vec<&str> = store.topics().collect();
    names.sort_unstable();
    for name in names {
        println!(
            "  {} — {} segments",
            args.segment_dir.join(sanitize_topic(name)).display(),
            store.segment_count(name),
        );
    }
    println!("Files:      {}", files);
    println!("Total:      {:.1} MB", bytes as f64 / 1_048_576.0);
    println!("Elapsed:    {:.1}s", started.elapsed().as_secs_f64());
    println!("========================================");

    Ok(())
}
