//! nexus-cli: command-line client for the Nexus HTTP API
//!
//! Local files are normalized with `nexus-ingest` before upload, so the server
//! only ever sees bounded text and base64 image payloads.
//!
//! # Subcommands
//! - `ingest <files…> [--note <text>] [--stream]`: extract a report and timeline
//! - `ask <question> [--attach <file>…] [--stream]`: ask the assistant
//! - `timeline [--json]`: list timeline records, newest first
//! - `insights [--refresh]`: show (or regenerate) insights
//! - `report`: print the accumulated report
//! - `forget <ids…>`: remove timeline records
//! - `reset [--subject <name>]`: start a fresh session
//! - `status`: show server health

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nexus_core::config::IngestConfig;
use nexus_core::models::{
    ClinicalRecord, ConversationTurn, Document, Insight, InsightSet, InsightStatus, TurnStatus,
};
use nexus_core::IngestOutcome;
use nexus_ingest::Normalizer;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";
/// Extraction and chat calls wait on the reasoning engine.
const ENGINE_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "nexus-cli",
    version,
    about = "Clinical document timeline, insights and assistant"
)]
struct Cli {
    /// Nexus HTTP server URL (overrides NEXUS_HTTP_URL env var)
    #[arg(long, env = "NEXUS_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload documents and extract a report and timeline records
    Ingest {
        /// Files to upload (text, markdown, JSON, JPEG, PNG or PDF)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Free-text instruction sent along with the documents
        #[arg(long)]
        note: Option<String>,

        /// Print the report as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// Ask the assistant a question about the current session
    Ask {
        question: String,

        /// Image attachments
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// List timeline records, newest first
    Timeline {
        /// Output records as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Show insights over the accumulated records
    Insights {
        /// Regenerate before showing
        #[arg(long)]
        refresh: bool,
    },

    /// Print the accumulated report
    Report,

    /// Remove timeline records by id
    Forget {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Clear the session
    Reset {
        /// Name used in the greeting
        #[arg(long)]
        subject: Option<String>,
    },

    /// Show Nexus server status
    Status,
}

// ============================================================================
// Output Formatting
// ============================================================================

/// First eight hex chars of a record id, enough to tell records apart on screen.
pub fn short_id(record: &ClinicalRecord) -> String {
    record.id.simple().to_string()[..8].to_string()
}

pub fn format_record(record: &ClinicalRecord) -> String {
    format!(
        "{:<10}  {:<17}  {}  #{}",
        record.timestamp,
        record.kind.as_str(),
        record.label,
        short_id(record)
    )
}

pub fn format_insight(insight: &Insight) -> String {
    let kind = format!("{:?}", insight.kind);
    let mut out = format!("[{}] {}\n    {}", kind, insight.title, insight.description);
    if !insight.source_ids.is_empty() {
        out.push_str(&format!("\n    sources: {}", insight.source_ids.join(", ")));
    }
    out
}

/// One-line summary of where the insight set stands.
pub fn describe_status(status: &InsightStatus) -> String {
    match status {
        InsightStatus::Empty => "no records yet".to_string(),
        InsightStatus::Pending { generation } => format!("regenerating (generation {})", generation),
        InsightStatus::Ready { generation } => format!("up to date (generation {})", generation),
        InsightStatus::Outdated { generation } => {
            format!("out of date, records are at generation {}; run with --refresh", generation)
        }
        InsightStatus::Unavailable { kind, reason } => {
            format!("unavailable ({:?}): {}", kind, reason)
        }
    }
}

/// Pull the human-readable message out of an error body.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(v) => match (v["error"].as_str(), v["kind"].as_str()) {
            (Some(error), Some(kind)) => format!("{} [{}]", error, kind),
            (Some(error), None) => error.to_string(),
            _ => body.to_string(),
        },
        Err(_) => body.to_string(),
    }
}

// ============================================================================
// Server-Sent Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Line-oriented SSE reader: `event:`/`data:` fields, blank line dispatches.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout: Option<Duration>) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder().timeout(timeout).build()?)
}

/// Unwrap a response or exit with the server's error message.
fn check(
    resp: reqwest::Result<reqwest::blocking::Response>,
    url: &str,
) -> reqwest::blocking::Response {
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            eprintln!("nexus-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("nexus-cli: server returned {}: {}", status, error_message(&body));
        std::process::exit(1);
    }
    resp
}

fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::blocking::Response, what: &str) -> T {
    match resp.json() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("nexus-cli: failed to parse {}: {}", what, e);
            std::process::exit(1);
        }
    }
}

fn normalize_all(files: &[PathBuf]) -> Vec<Document> {
    let normalizer = Normalizer::new(IngestConfig::default());
    files
        .iter()
        .map(|path| match normalizer.normalize_path(path) {
            Ok(doc) => doc,
            Err(e) => {
                eprintln!("nexus-cli: cannot read {}: {}", path.display(), e);
                std::process::exit(1);
            }
        })
        .collect()
}

/// Relay `delta` events to stdout and return the terminal event's data.
fn relay_stream(resp: reqwest::blocking::Response) -> anyhow::Result<SseEvent> {
    let mut parser = SseParser::default();
    let mut stdout = std::io::stdout();

    for line in BufReader::new(resp).lines() {
        let Some(event) = parser.push_line(&line?) else {
            continue;
        };
        match event.event.as_str() {
            "delta" => {
                write!(stdout, "{}", event.data)?;
                stdout.flush()?;
            }
            "done" | "error" => {
                writeln!(stdout)?;
                return Ok(event);
            }
            _ => {}
        }
    }

    eprintln!("\nnexus-cli: stream ended without a result");
    std::process::exit(1);
}

fn print_outcome(outcome: &IngestOutcome) {
    println!(
        "Extracted {} record(s), generation {}",
        outcome.records.len(),
        outcome.generation
    );
    if outcome.duplicates > 0 {
        println!("Skipped {} duplicate record(s)", outcome.duplicates);
    }
    for record in &outcome.records {
        println!("  {}", format_record(record));
    }
}

fn do_ingest(server: &str, files: &[PathBuf], note: Option<&str>, stream: bool) -> anyhow::Result<()> {
    let documents = normalize_all(files);
    let body = serde_json::json!({ "documents": documents, "note": note });

    if stream {
        let url = format!("{}/documents/stream", server);
        let resp = check(client(None)?.post(&url).json(&body).send(), &url);
        let terminal = relay_stream(resp)?;
        if terminal.event == "error" {
            eprintln!("nexus-cli: extraction failed: {}", error_message(&terminal.data));
            std::process::exit(1);
        }
        let outcome: IngestOutcome = serde_json::from_str(&terminal.data)?;
        print_outcome(&outcome);
        return Ok(());
    }

    let url = format!("{}/documents", server);
    let timeout = Some(Duration::from_secs(ENGINE_TIMEOUT_SECS));
    let resp = check(client(timeout)?.post(&url).json(&body).send(), &url);
    let outcome: IngestOutcome = parse(resp, "ingest response");
    println!("{}\n", outcome.report);
    print_outcome(&outcome);
    Ok(())
}

fn do_ask(server: &str, question: &str, attachments: &[PathBuf], stream: bool) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "question": question,
        "attachments": normalize_all(attachments),
    });

    let turn: ConversationTurn = if stream {
        let url = format!("{}/chat/stream", server);
        let resp = check(client(None)?.post(&url).json(&body).send(), &url);
        let terminal = relay_stream(resp)?;
        if terminal.event == "error" {
            eprintln!("nexus-cli: {}", error_message(&terminal.data));
            std::process::exit(1);
        }
        serde_json::from_str(&terminal.data)?
    } else {
        let url = format!("{}/chat", server);
        let timeout = Some(Duration::from_secs(ENGINE_TIMEOUT_SECS));
        let resp = check(client(timeout)?.post(&url).json(&body).send(), &url);
        let turn: ConversationTurn = parse(resp, "chat response");
        if turn.status != TurnStatus::Failed {
            println!("{}", turn.content);
        }
        turn
    };

    match turn.status {
        TurnStatus::Failed => {
            eprintln!("nexus-cli: {}", turn.content);
            std::process::exit(1);
        }
        TurnStatus::Partial => eprintln!("nexus-cli: answer was cut off"),
        _ => {}
    }
    Ok(())
}

fn do_timeline(server: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/timeline", server);
    let resp = check(client(Some(Duration::from_secs(10)))?.get(&url).send(), &url);
    let body: serde_json::Value = parse(resp, "timeline");
    let records: Vec<ClinicalRecord> = serde_json::from_value(body["records"].clone())?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        eprintln!("Timeline is empty");
        return Ok(());
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    Ok(())
}

fn do_insights(server: &str, refresh: bool) -> anyhow::Result<()> {
    let set: InsightSet = if refresh {
        let url = format!("{}/insights/refresh", server);
        let timeout = Some(Duration::from_secs(ENGINE_TIMEOUT_SECS));
        let resp = check(client(timeout)?.post(&url).send(), &url);
        let body: serde_json::Value = parse(resp, "refresh response");
        if body["refresh"]["outcome"] == "stale" {
            eprintln!("Records changed during regeneration; showing the latest set");
        }
        serde_json::from_value(body["insights"].clone())?
    } else {
        let url = format!("{}/insights", server);
        let resp = check(client(Some(Duration::from_secs(10)))?.get(&url).send(), &url);
        parse(resp, "insights")
    };

    println!("Insights: {}", describe_status(&set.status));
    for insight in &set.insights {
        println!("\n{}", format_insight(insight));
    }
    Ok(())
}

fn do_report(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/report", server);
    let resp = check(client(Some(Duration::from_secs(10)))?.get(&url).send(), &url);
    let body: serde_json::Value = parse(resp, "report");
    match body["report"].as_str() {
        Some(report) if !report.is_empty() => println!("{}", report),
        _ => eprintln!("No report yet"),
    }
    Ok(())
}

fn do_forget(server: &str, ids: &[String]) -> anyhow::Result<()> {
    let url = format!("{}/timeline/remove", server);
    let body = serde_json::json!({ "ids": ids });
    let resp = check(client(Some(Duration::from_secs(10)))?.post(&url).json(&body).send(), &url);
    let body: serde_json::Value = parse(resp, "remove response");
    println!("Removed {} record(s)", body["removed"].as_u64().unwrap_or(0));
    Ok(())
}

fn do_reset(server: &str, subject: Option<&str>) -> anyhow::Result<()> {
    let url = format!("{}/session/reset", server);
    let body = serde_json::json!({ "subject": subject });
    let resp = check(client(Some(Duration::from_secs(10)))?.post(&url).json(&body).send(), &url);
    let body: serde_json::Value = parse(resp, "reset response");
    if let Some(greeting) = body["conversation"][0]["content"].as_str() {
        println!("{}", greeting);
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(Some(Duration::from_secs(10)))?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Nexus server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("Records:      {}", body["records"].as_u64().unwrap_or(0));
            println!("Generation:   {}", body["generation"].as_u64().unwrap_or(0));
            println!("Insights:     {}", body["insights"]["state"].as_str().unwrap_or("?"));
            println!("Socket:       {}", body["socket"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("nexus-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("nexus-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Ingest { files, note, stream } => do_ingest(&server, &files, note.as_deref(), stream),
        Commands::Ask {
            question,
            attachments,
            stream,
        } => do_ask(&server, &question, &attachments, stream),
        Commands::Timeline { json } => do_timeline(&server, json),
        Commands::Insights { refresh } => do_insights(&server, refresh),
        Commands::Report => do_report(&server),
        Commands::Forget { ids } => do_forget(&server, &ids),
        Commands::Reset { subject } => do_reset(&server, subject.as_deref()),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("nexus-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
