#![forbid(unsafe_code)]

mod fixture;

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use rtsum_scrub::{
    CheckStage, CorruptionFinding, Geometry, RtSummaryChecker, RtSummaryConfig, Verdict,
};
use rtsum_types::{BlockSize, RtFormat};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::fixture::Fixture;

/// Exit status when a check completes and finds corruption.
const EXIT_CORRUPT: i32 = 2;

/// Cancellation context for a CLI check.
fn cli_cx() -> Cx {
    Cx::for_request()
}

#[derive(Debug, Serialize)]
struct GeometryOutput {
    block_size: u32,
    rextsize: u32,
    format: RtFormat,
    block_words: u32,
    #[serde(flatten)]
    geometry: Geometry,
}

#[derive(Debug, Serialize)]
struct CheckOutput {
    verdict: Verdict,
    stage: CheckStage,
    records_scanned: u64,
    blocks_compared: u64,
    finding: Option<CorruptionFinding>,
    geometry: Geometry,
}

fn main() {
    init_tracing();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_CORRUPT),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns `Ok(false)` when a check found corruption.
fn run() -> Result<bool> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(true);
    };

    match command.as_str() {
        "geometry" => {
            let rest: Vec<String> = args.collect();
            geometry_cmd(&rest).map(|()| true)
        }
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires a fixture path");
            };
            let json = args.any(|arg| arg == "--json");
            check_cmd(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(true)
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("rtsum\n");
    println!("USAGE:");
    println!(
        "  rtsum geometry --rblocks <n> [--block-size <bytes>] [--rextsize <n>] \
         [--format legacy|grouped] [--json]"
    );
    println!("  rtsum check <fixture.json> [--json]");
}

fn geometry_cmd(args: &[String]) -> Result<()> {
    let mut rblocks = None;
    let mut block_size = 4096_u32;
    let mut rextsize = 1_u32;
    let mut format = RtFormat::Legacy;
    let mut json = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--rblocks" => rblocks = Some(parse_value(arg, iter.next())?),
            "--block-size" => block_size = parse_value(arg, iter.next())?,
            "--rextsize" => rextsize = parse_value(arg, iter.next())?,
            "--format" => {
                format = match iter.next().map(String::as_str) {
                    Some("legacy") => RtFormat::Legacy,
                    Some("grouped") => RtFormat::Grouped,
                    other => bail!("--format expects legacy or grouped, got {other:?}"),
                };
            }
            other => bail!("unknown geometry option: {other}"),
        }
    }
    let Some(rblocks) = rblocks else {
        bail!("geometry requires --rblocks");
    };

    let block_size = BlockSize::new(block_size).context("invalid --block-size")?;
    let config = RtSummaryConfig::new(block_size, rextsize, format)?;
    let geometry = Geometry::compute(&config, rblocks)?;
    let output = GeometryOutput {
        block_size: block_size.get(),
        rextsize,
        format,
        block_words: config.block_words(),
        geometry,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("block_size: {}", output.block_size);
        println!("rextsize: {}", output.rextsize);
        println!("format: {:?}", output.format);
        println!("block_words: {}", output.block_words);
        println!("rextents: {}", geometry.rextents);
        println!("rbmblocks: {}", geometry.bitmap_blocks);
        println!("rsumlevels: {}", geometry.summary_levels);
        println!("rsumblocks: {}", geometry.summary_blocks);
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(value) = value else {
        bail!("{flag} requires a value");
    };
    value
        .parse()
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

fn check_cmd(path: &Path, json: bool) -> Result<bool> {
    let fixture = Fixture::load(path)?;
    let bitmap = fixture.build_bitmap()?;
    let summary = fixture.build_summary()?;

    info!(fixture = %path.display(), "checking realtime summary");
    let cx = cli_cx();
    let report = RtSummaryChecker::new(fixture.config, fixture.superblock, &bitmap, &summary)?
        .with_terminate(&cx)
        .check()
        .context("realtime summary check did not complete")?;

    let output = CheckOutput {
        verdict: report.verdict(),
        stage: report.stage,
        records_scanned: report.records_scanned,
        blocks_compared: report.blocks_compared,
        finding: report.finding().cloned(),
        geometry: report.geometry,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("verdict: {}", output.verdict);
        println!("stage: {}", output.stage);
        println!("records_scanned: {}", output.records_scanned);
        println!("blocks_compared: {}", output.blocks_compared);
        if let Some(finding) = &output.finding {
            println!("finding: {finding}");
        }
    }
    Ok(output.finding.is_none())
}
