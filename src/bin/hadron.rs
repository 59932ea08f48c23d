//! Hadron CLI - run API test entities from a YAML bundle.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use hadron::{
    Engine, ExecutionResult, MemoryStore, NodeKind, NodeStatus,
    RunOptions, TraceSink,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Hadron - API test execution engine.
#[derive(Parser, Debug)]
#[command(name = "hadron", version, about)]
struct Cli {
    /// Entity bundle file (YAML).
    #[arg(short = 'p', long = "path")]
    bundle_path: String,

    /// Test case id to run. Omit to run every test case in the
    /// bundle.
    #[arg(short = 'c', long = "case")]
    case_id: Option<String>,

    /// Runtime parameter override (key=value), repeatable. Values
    /// parse as JSON when possible, else as strings.
    #[arg(long = "param")]
    params: Vec<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Run-level timeout in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Directory to save result report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Print the trace span stream to stderr.
    #[arg(long = "trace")]
    trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

/// Parse repeated `--param key=value` flags. Values that parse as
/// JSON keep their type, anything else is a string.
fn parse_params(raw: &[String]) -> Result<HashMap<String, Value>> {
    let mut params = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid --param '{entry}', expected key=value"))?;
        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        params.insert(key.to_string(), parsed);
    }
    Ok(params)
}

fn status_marker(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Passed => "\x1b[32m✓\x1b[0m",
        NodeStatus::Failed => "\x1b[31m✗\x1b[0m",
        NodeStatus::Error => "\x1b[31m!\x1b[0m",
        NodeStatus::Skipped => "\x1b[33m-\x1b[0m",
    }
}

fn print_result(result: &ExecutionResult, verbose: bool) {
    let overall = if result.status == NodeStatus::Passed {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} {}: {} ({} ms)",
        overall, result.node_name, status_text(result.status), result.duration_ms
    );
    for child in &result.children {
        print_node(child, 1, verbose);
    }
}

fn status_text(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Passed => "PASSED",
        NodeStatus::Failed => "FAILED",
        NodeStatus::Error => "ERROR",
        NodeStatus::Skipped => "SKIPPED",
    }
}

fn print_node(node: &ExecutionResult, depth: usize, verbose: bool) {
    let indent = "  ".repeat(depth);
    info!(
        "{}{} {} ({} ms)",
        indent,
        status_marker(node.status),
        node.node_name,
        node.duration_ms
    );

    if let Some(err) = &node.error {
        error!("{}  \x1b[31m{}\x1b[0m", indent, err);
    }

    if verbose {
        for outcome in &node.assertions {
            let mark = if outcome.passed { "✓" } else { "✗" };
            debug!(
                "{}  {} {} {:?} {}",
                indent, mark, outcome.target, outcome.operator, outcome.expected
            );
        }
        if let Some(request) = &node.request {
            debug!("{}  Request: {} {}", indent, request.method, request.url);
        }
        if let Some(response) = &node.response {
            debug!("{}  Response: status {}", indent, response.status);
            if let Some(body) = &response.body {
                let truncated = if body.len() > 500 {
                    format!("{}...(truncated)", &body[..500])
                } else {
                    body.clone()
                };
                debug!("{}  Response body: {}", indent, truncated);
            }
        }
    }

    for child in &node.children {
        print_node(child, depth + 1, verbose);
    }
}

fn save_report(
    result: &ExecutionResult,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result.node_name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => {
            let filename = format!("{sanitized_name}-{timestamp}.json");
            let content = serde_json::to_string_pretty(result)?;
            (filename, content)
        }
        ReportFormat::Yaml => {
            let filename = format!("{sanitized_name}-{timestamp}.yaml");
            let content = serde_yaml::to_string(result)?;
            (filename, content)
        }
        ReportFormat::Text => {
            let filename = format!("{sanitized_name}-{timestamp}.txt");
            let mut content = String::new();
            write_text_node(&mut content, result, 0);
            (filename, content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn write_text_node(out: &mut String, node: &ExecutionResult, depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&format!(
        "{}{} [{}] ({} ms)\n",
        indent,
        node.node_name,
        status_text(node.status),
        node.duration_ms
    ));
    if let Some(err) = &node.error {
        out.push_str(&format!("{}  Error: {err}\n", indent));
    }
    for outcome in &node.assertions {
        out.push_str(&format!(
            "{}  {} {} {:?} expected {}\n",
            indent,
            if outcome.passed { "✓" } else { "✗" },
            outcome.target,
            outcome.operator,
            outcome.expected
        ));
    }
    for child in &node.children {
        write_text_node(out, child, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let store = MemoryStore::from_file(&args.bundle_path)
        .context("Failed to load entity bundle")?;

    let case_ids = match &args.case_id {
        Some(id) => vec![id.clone()],
        None => store.test_case_ids(),
    };
    if case_ids.is_empty() {
        return Err(anyhow!("No test cases found in bundle"));
    }

    let runtime_params = parse_params(&args.params)?;
    let report_dir = args.report_dir.map(PathBuf::from);

    let mut engine = Engine::new(Arc::new(store));
    let trace_task = if args.trace {
        let (sink, mut rx) = TraceSink::channel();
        engine = engine.with_trace_sink(sink);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        }))
    } else {
        None
    };

    let options = RunOptions {
        runtime_params,
        timeout: args.timeout.map(Duration::from_secs),
    };

    let total = case_ids.len();
    let mut passed = 0;
    let mut failed = 0;
    info!("Running {} test case(s)...", total);

    for (idx, case_id) in case_ids.iter().enumerate() {
        info!("Test case {}/{}: {}", idx + 1, total, case_id);
        match engine
            .run_with_options(NodeKind::TestCase, case_id, options.clone())
            .await
        {
            Ok(result) => {
                print_result(&result, args.verbose);

                if let Some(dir) = &report_dir {
                    match save_report(&result, dir, args.report_format) {
                        Ok(path) => {
                            info!("Report saved: {}", path.display())
                        }
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }

                if result.status == NodeStatus::Passed {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!(
                    "\x1b[31mConfiguration error: {} - {}\x1b[0m",
                    case_id, e
                );
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m",
        passed + failed,
        passed,
        failed
    );

    drop(engine);
    if let Some(task) = trace_task {
        let _ = task.await;
    }

    if failed > 0 {
        exit(1);
    }
    Ok(())
}
