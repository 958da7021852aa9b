use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use petrel_script::harness::{self, GoldenVerdict};

const USAGE: &str = "\
usage: page_harness run|check|record <fixture.json>...
  run     evaluate each fixture and print its output JSON
  check   replay each fixture against its .golden.json neighbor
  record  write each fixture's output to its .golden.json neighbor";

#[derive(Clone, Copy)]
enum Mode {
    Run,
    Check,
    Record,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), None | Some("--help") | Some("-h")) {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    let (mode, fixtures) = match parse(&args) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[page-harness] {err:#}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };
    let mut failed = 0usize;
    for path in &fixtures {
        if let Err(err) = run_one(mode, path) {
            eprintln!("[page-harness] {}: {err:#}", path.display());
            failed += 1;
        }
    }
    if failed > 0 {
        eprintln!("[page-harness] {failed} of {} fixture(s) failed", fixtures.len());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn parse(args: &[String]) -> Result<(Mode, Vec<PathBuf>)> {
    let (mode, rest) = args.split_first().context("missing mode")?;
    let mode = match mode.as_str() {
        "run" => Mode::Run,
        "check" => Mode::Check,
        "record" => Mode::Record,
        other => bail!("unknown mode '{other}'"),
    };
    if rest.is_empty() {
        bail!("no fixture files given");
    }
    Ok((mode, rest.iter().map(PathBuf::from).collect()))
}

fn run_one(mode: Mode, path: &Path) -> Result<()> {
    match mode {
        Mode::Run => {
            let output = harness::run_fixture(&harness::load_fixture(path)?)?;
            let rendered =
                serde_json::to_string_pretty(&output).context("rendering harness output")?;
            println!("{rendered}");
        }
        Mode::Check => match harness::check_against_golden(path)? {
            GoldenVerdict::Matched => println!("[page-harness] ok {}", path.display()),
            GoldenVerdict::Mismatched { expected, actual } => bail!(
                "diverged from {} (rerun in record mode to accept)\n  golden: {}\n  actual: {}",
                harness::golden_path(path).display(),
                serde_json::to_string(&expected).context("rendering golden output")?,
                serde_json::to_string(&actual).context("rendering harness output")?,
            ),
        },
        Mode::Record => {
            let golden = harness::record_golden(path)?;
            println!("[page-harness] recorded {}", golden.display());
        }
    }
    Ok(())
}
