use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use flate2::read::GzDecoder;
use pdr_fusion::config::EngineConfig;
use pdr_fusion::map_match::VectorMap;
use pdr_fusion::sensor_fusion::{FusionEngine, FusionEvent};
use pdr_fusion::types::{secs_to_nanos, InitialPose, Pose, SensorSample};
use serde_json::json;

#[derive(Parser, Debug, Clone)]
#[command(about = "Replay a recorded sensor log through the PDR fusion engine")]
struct Args {
    /// Path to a JSON-lines sample log (.jsonl or .jsonl.gz), one sample per line
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of logs to batch replay (processes *.jsonl[.gz], summaries only)
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// Engine config JSON (partial configs keep defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Vector map JSON with corridors and walls
    #[arg(long)]
    map: Option<PathBuf>,

    /// Fusion tick rate (defaults to the config's update rate)
    #[arg(long)]
    tick_hz: Option<f64>,

    /// Print the summary only, no per-tick poses
    #[arg(long, default_value_t = false)]
    summary_only: bool,
}

fn open_log(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

fn load_samples(path: &Path) -> anyhow::Result<Vec<SensorSample>> {
    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in open_log(path)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SensorSample>(&line) {
            Ok(sample) => samples.push(sample),
            Err(e) => {
                skipped += 1;
                log::debug!("{}:{}: {}", path.display(), line_no + 1, e);
            }
        }
    }
    if skipped > 0 {
        log::warn!("{}: skipped {} malformed lines", path.display(), skipped);
    }
    samples.sort_by_key(|s| s.timestamp_ns);
    Ok(samples)
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_json_str(&text)?
        }
        None => EngineConfig::default(),
    };
    if let Some(path) = args.map.as_ref() {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        config.vector_map = Some(VectorMap::from_json_str(&text)?);
    }
    config.validate()?;
    Ok(config)
}

fn run_once(path: &Path, config: &EngineConfig, args: &Args, out: &mut dyn Write) -> anyhow::Result<serde_json::Value> {
    let samples = load_samples(path)?;
    let mut engine = FusionEngine::new(config.clone())?;

    let Some(first) = samples.first() else {
        anyhow::bail!("{} holds no samples", path.display());
    };
    let start_ns = first.timestamp_ns;
    let end_ns = samples.last().map_or(start_ns, |s| s.timestamp_ns);
    let tick_dt = args.tick_hz.map(|hz| 1.0 / hz).unwrap_or_else(|| config.nominal_dt());
    let period_ns = secs_to_nanos(tick_dt).max(1);

    let mut rejected = 0u64;
    let mut ticks = 0u64;
    let mut steps = 0u64;
    let mut diagnostics = 0u64;
    let mut drift_events = 0u64;
    let mut last_pose: Option<Pose> = None;
    let mut min_confidence = f64::INFINITY;
    let mut idx = 0;
    let mut t = start_ns;

    loop {
        while idx < samples.len() && samples[idx].timestamp_ns <= t {
            if let Err(e) = engine.push_sample(samples[idx].clone()) {
                rejected += 1;
                log::debug!("sample {} rejected: {}", idx, e);
            }
            idx += 1;
        }

        match engine.tick(t) {
            Ok(pose) => {
                ticks += 1;
                min_confidence = min_confidence.min(pose.confidence);
                if !args.summary_only {
                    writeln!(out, "{}", serde_json::to_string(&pose)?)?;
                }
                last_pose = Some(pose);
            }
            Err(e) if e.is_recoverable() => log::warn!("tick at {} ns: {}", t, e),
            Err(e) => {
                log::error!("engine corrupt at {} ns: {}", t, e);
                engine.reset(last_pose.map(|p| InitialPose {
                    x: p.x,
                    y: p.y,
                    z: p.z,
                    yaw: p.yaw,
                }));
            }
        }

        for event in engine.take_events() {
            match event {
                FusionEvent::Step(_) => steps += 1,
                FusionEvent::HeadingDrift(drift) => {
                    drift_events += 1;
                    log::info!("compass drift: mean accuracy {:.1}°", drift.mean_accuracy_deg);
                }
                FusionEvent::Diagnostic { .. } | FusionEvent::Corrupted { .. } => diagnostics += 1,
                _ => {}
            }
        }

        if t >= end_ns {
            break;
        }
        t = t.saturating_add(period_ns);
    }

    let state = engine.full_state();
    Ok(json!({
        "log": path.display().to_string(),
        "samples": samples.len(),
        "rejected": rejected,
        "ticks": ticks,
        "duration_s": (end_ns - start_ns) as f64 / 1e9,
        "steps": steps,
        "drift_events": drift_events,
        "diagnostics": diagnostics,
        "min_confidence": if min_confidence.is_finite() { min_confidence } else { 0.0 },
        "final_pose": last_pose,
        "ekf": state.ekf,
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(hz) = args.tick_hz {
        anyhow::ensure!(hz.is_finite() && hz > 0.0, "--tick-hz must be positive");
    }

    let config = load_config(&args)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                path.is_file() && (name.ends_with(".jsonl") || name.ends_with(".jsonl.gz"))
            })
            .collect();
        paths.sort();
        for path in paths {
            match run_once(&path, &config, &Args { summary_only: true, ..args.clone() }, &mut out) {
                Ok(res) => results.push(res),
                Err(e) => log::error!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &config, &args, &mut out)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    out.flush()?;
    eprintln!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
