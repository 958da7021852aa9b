use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ScriptConfig;
use crate::engine::{CollectingAlertHandler, ScriptEngine};
use crate::error::{CollectingReporter, ScriptError};

/// A page's scripting content: units in document order, an optional load
/// handler, and the engine settings to run them under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageFixture {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub timeout_millis: u64,
    #[serde(default)]
    pub throw_on_error: bool,
    pub units: Vec<UnitFixture>,
    #[serde(default)]
    pub onload: Option<String>,
    #[serde(default)]
    pub wait_for_jobs_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitFixture {
    pub source: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_start_line")]
    pub start_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub url: String,
    pub units: Vec<UnitOutcome>,
    pub alerts: Vec<String>,
    pub errors: Vec<ErrorSummary>,
    pub pending_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub kind: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

/// Runs a page fixture end to end on a fresh engine and shuts it down.
pub fn run_fixture(fixture: &PageFixture) -> Result<HarnessOutput> {
    let config = ScriptConfig {
        timeout_millis: fixture.timeout_millis,
        throw_on_error: fixture.throw_on_error,
    };
    let engine = ScriptEngine::with_config(&config);
    let alerts = CollectingAlertHandler::new();
    let reporter = CollectingReporter::new();
    engine.set_alert_handler(Arc::new(alerts.clone()));
    engine.set_error_reporter(Arc::new(reporter.clone()));

    let window = engine.create_window();
    let page = engine.navigate(window, &fixture.url);

    let mut units = Vec::with_capacity(fixture.units.len() + 1);
    for (idx, unit) in fixture.units.iter().enumerate() {
        let name = unit.name.clone().unwrap_or_else(|| format!("unit{idx}"));
        let outcome = engine.execute(&page, &unit.source, &name, unit.start_line);
        let stop = outcome.is_err();
        units.push(unit_outcome(name, outcome));
        if stop {
            break;
        }
    }
    if let Some(onload) = &fixture.onload {
        let outcome = engine.execute(&page, onload, "onload", 1);
        units.push(unit_outcome("onload".to_string(), outcome));
    }

    let pending_jobs = if fixture.wait_for_jobs_millis > 0 {
        engine.wait_for_jobs(window, Duration::from_millis(fixture.wait_for_jobs_millis))
    } else {
        engine.job_count(window)
    };
    engine.shutdown();

    let errors = reporter.errors().iter().map(summarize_error).collect();
    Ok(HarnessOutput {
        url: fixture.url.clone(),
        units,
        alerts: alerts.messages(),
        errors,
        pending_jobs,
    })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<PageFixture> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    Ok(serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?)
}

/// Verdict from replaying a fixture against its golden recording.
#[derive(Debug, Clone, PartialEq)]
pub enum GoldenVerdict {
    Matched,
    Mismatched { expected: Box<HarnessOutput>, actual: Box<HarnessOutput> },
}

pub fn golden_path<P: AsRef<Path>>(fixture: P) -> PathBuf {
    fixture.as_ref().with_extension("golden.json")
}

pub fn load_golden<P: AsRef<Path>>(path: P) -> Result<HarnessOutput> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("opening golden '{}'", path.as_ref().display()))?;
    Ok(serde_json::from_reader(file).with_context(|| "parsing golden JSON")?)
}

pub fn check_against_golden<P: AsRef<Path>>(path: P) -> Result<GoldenVerdict> {
    let path = path.as_ref();
    let actual = run_fixture(&load_fixture(path)?)?;
    let expected = load_golden(golden_path(path))?;
    Ok(if expected == actual {
        GoldenVerdict::Matched
    } else {
        GoldenVerdict::Mismatched { expected: Box::new(expected), actual: Box::new(actual) }
    })
}

/// Replays a fixture and records its output as the new golden beside it.
pub fn record_golden<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    let output = run_fixture(&load_fixture(path)?)?;
    let golden = golden_path(path);
    let file = File::create(&golden)
        .with_context(|| format!("writing golden '{}'", golden.display()))?;
    serde_json::to_writer_pretty(file, &output).with_context(|| "serializing golden JSON")?;
    Ok(golden)
}

fn unit_outcome(unit: String, outcome: Result<rhai::Dynamic, ScriptError>) -> UnitOutcome {
    match outcome {
        Ok(value) => UnitOutcome {
            unit,
            status: "ok".to_string(),
            value: render_value(&value),
            error: None,
        },
        Err(error) => UnitOutcome {
            unit,
            status: "error".to_string(),
            value: None,
            error: Some(error.to_string()),
        },
    }
}

fn render_value(value: &rhai::Dynamic) -> Option<serde_json::Value> {
    if value.is::<()>() {
        return None;
    }
    match rhai::serde::from_dynamic(value) {
        Ok(json) => Some(json),
        Err(_) => Some(serde_json::Value::String(value.to_string())),
    }
}

fn summarize_error(error: &ScriptError) -> ErrorSummary {
    ErrorSummary {
        kind: error.kind.label().to_string(),
        unit: error.unit.clone(),
        line: error.line,
        message: error.message.clone(),
    }
}

fn default_url() -> String {
    "http://localhost/".to_string()
}

fn default_start_line() -> usize {
    1
}
