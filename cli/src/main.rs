use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use spangraph::server;
use spangraph_core::engine::{Answer, BatchReport, SearchResults};
use spangraph_core::pending::PendingEntry;
use spangraph_core::relational::{Operation, TraceRecord};
use spangraph_core::{Config, Span};

#[derive(Parser)]
#[command(name = "spangraph")]
#[command(
    about = "Graph-backed search and question answering over distributed traces",
    long_about = None
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "spangraph.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Spangraph server
    Serve {
        /// Override verbose setting from config
        #[arg(short, long)]
        verbose: bool,
    },

    /// Send spans from a JSON file to the server
    Ingest {
        /// File holding either `{"spans": [...]}` or a bare array of spans
        file: std::path::PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// Rank traces by relevance to a free-text query
    Search {
        query: String,
        #[arg(short, long)]
        limit: Option<i64>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// Ask a question about one trace
    Ask {
        #[arg(short = 'i', long = "trace-id")]
        trace_id: String,
        #[arg(short, long)]
        question: String,
        /// Causal hops to walk from the anchor span
        #[arg(long)]
        hop: Option<i64>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// Show the stored spans of a trace
    Trace {
        #[arg(short = 'i', long = "id")]
        trace_id: String,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// List edges still waiting for their parent span
    Pending {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// List every service that has sent spans
    Services {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// List the operations of one service
    Operations {
        service: String,
        /// Only show operations of this span kind (client, server, ...)
        #[arg(short = 'k', long)]
        span_kind: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        server: Option<String>,
    },

    /// Print the default configuration
    Config,
}

#[derive(Debug, Deserialize, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpanFile {
    Batch { spans: Vec<Span> },
    List(Vec<Span>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    // Load configuration
    let mut config = if cli.config.exists() {
        eprintln!("📝 Loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)?
    } else {
        eprintln!(
            "⚠️  Config file not found at {:?}, using defaults",
            cli.config
        );
        Config::default()
    };

    // Validate configuration
    config.validate()?;

    let default_server = format!("http://{}:{}", config.server.host, config.server.port);
    let client = Client::new();

    match cli.command {
        Commands::Serve { verbose } => {
            if verbose {
                config.server.verbose = true;
            }

            println!(
                "🚀 Starting Spangraph server on {}:{}",
                config.server.host, config.server.port
            );
            server::start_server(config).await?;
        }
        Commands::Ingest { file, json, server } => {
            let server_url = server.unwrap_or(default_server);
            handle_ingest(&client, &server_url, &file, json).await?;
        }
        Commands::Search {
            query,
            limit,
            json,
            server,
        } => {
            let server_url = server.unwrap_or(default_server);
            handle_search(&client, &server_url, &query, limit, json).await?;
        }
        Commands::Ask {
            trace_id,
            question,
            hop,
            json,
            server,
        } => {
            let server_url = server.unwrap_or(default_server);
            handle_ask(&client, &server_url, &trace_id, &question, hop, json).await?;
        }
        Commands::Trace {
            trace_id,
            json,
            server,
        } => {
            let server_url = server.unwrap_or(default_server);
            handle_trace(&client, &server_url, &trace_id, json).await?;
        }
        Commands::Pending { json, server } => {
            let server_url = server.unwrap_or(default_server);
            handle_pending(&client, &server_url, json).await?;
        }
        Commands::Services { json, server } => {
            let server_url = server.unwrap_or(default_server);
            handle_services(&client, &server_url, json).await?;
        }
        Commands::Operations {
            service,
            span_kind,
            json,
            server,
        } => {
            let server_url = server.unwrap_or(default_server);
            handle_operations(&client, &server_url, &service, span_kind.as_deref(), json).await?;
        }
        Commands::Config => {}
    }

    Ok(())
}

async fn handle_ingest(
    client: &Client,
    server: &str,
    file: &std::path::Path,
    json: bool,
) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let spans = match serde_json::from_str::<SpanFile>(&contents)
        .with_context(|| format!("{} does not hold a span batch", file.display()))?
    {
        SpanFile::Batch { spans } | SpanFile::List(spans) => spans,
    };

    let url = format!("{}/api/spans", server);
    let request = client.post(&url).json(&json!({ "spans": spans }));
    let response: ApiResponse<BatchReport> = send(request, &url).await?;

    let report = response
        .data
        .ok_or_else(|| anyhow!(error_message(&response.error)))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "📥 Wrote {} spans ({} skipped, {} failed)",
            report.written,
            report.skipped,
            report.failures.len()
        );
        for failure in &report.failures {
            println!("   ❌ {} [{:?}] {}", failure.span_id, failure.kind, failure.error);
        }
    }

    if !response.success {
        return Err(anyhow!(error_message(&response.error)));
    }
    Ok(())
}

async fn handle_search(
    client: &Client,
    server: &str,
    query: &str,
    limit: Option<i64>,
    json: bool,
) -> Result<()> {
    let mut url = format!("{}/api/search?query={}", server, urlencoding::encode(query));
    if let Some(limit) = limit {
        url.push_str(&format!("&limit={}", limit));
    }
    let data: SearchResults = fetch(client.get(&url), &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("🔍 {} traces matching {:?}", data.traces.len(), query);
    println!(
        "{:<4} {:<34} {:>7} {:>6}  {}",
        "#", "TRACE ID", "SCORE", "SPANS", "ROOT"
    );
    for (rank, hit) in data.traces.iter().enumerate() {
        let record = data.records.iter().find(|r| r.trace_id == hit.trace_id);
        let root = record
            .and_then(|r| r.spans.first())
            .map(|s| format!("{} {}", s.service_name(), s.operation_name))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<4} {:<34} {:>7.3} {:>6}  {}",
            rank + 1,
            hit.trace_id,
            hit.score,
            record.map_or(0, |r| r.spans.len()),
            root
        );
    }
    Ok(())
}

async fn handle_ask(
    client: &Client,
    server: &str,
    trace_id: &str,
    question: &str,
    hop: Option<i64>,
    json: bool,
) -> Result<()> {
    let url = format!("{}/api/ask", server);
    let request = client.post(&url).json(&json!({
        "trace_id": trace_id,
        "question": question,
        "hop": hop,
    }));
    let data: Answer = fetch(request, &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!(
        "💬 Trace {} (anchor {}, {} hops)",
        data.trace_id, data.passage.anchor, data.hop
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    print!("{}", data.passage.text());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", data.answer);
    Ok(())
}

async fn handle_trace(client: &Client, server: &str, trace_id: &str, json: bool) -> Result<()> {
    let url = format!("{}/api/traces/{}", server, trace_id);
    let data: TraceRecord = fetch(client.get(&url), &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("🔍 Trace {} ({} spans)", data.trace_id, data.spans.len());
    println!(
        "{:<18} {:<18} {:>12}  {}",
        "SPAN ID", "PARENT", "DURATION", "SERVICE / OPERATION"
    );
    for span in &data.spans {
        let parent = span
            .references
            .first()
            .map(|r| r.span_id.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<18} {:<18} {:>10.3}ms  {} / {}",
            span.span_id,
            parent,
            span.duration_ns as f64 / 1_000_000.0,
            span.service_name(),
            span.operation_name
        );
    }
    Ok(())
}

async fn handle_pending(client: &Client, server: &str, json: bool) -> Result<()> {
    let url = format!("{}/api/pending", server);
    let data: Vec<PendingEntry> = fetch(client.get(&url), &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if data.is_empty() {
        println!("✅ No pending edges");
        return Ok(());
    }
    println!("⏳ {} parents not yet ingested", data.len());
    for entry in data {
        for edge in entry.edges {
            println!("   {} -[{}]-> {}", entry.parent, edge.relation, edge.child);
        }
    }
    Ok(())
}

async fn handle_services(client: &Client, server: &str, json: bool) -> Result<()> {
    let url = format!("{}/api/services", server);
    let data: Vec<String> = fetch(client.get(&url), &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("🧭 {} services", data.len());
    for service in data {
        println!("   {}", service);
    }
    Ok(())
}

async fn handle_operations(
    client: &Client,
    server: &str,
    service: &str,
    span_kind: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut url = format!(
        "{}/api/services/{}/operations",
        server,
        urlencoding::encode(service)
    );
    if let Some(kind) = span_kind {
        url.push_str(&format!("?span_kind={}", urlencoding::encode(kind)));
    }
    let data: Vec<Operation> = fetch(client.get(&url), &url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("🧭 {} operations of {}", data.len(), service);
    println!("{:<12} {}", "KIND", "OPERATION");
    for op in data {
        println!("{:<12} {}", op.span_kind, op.name);
    }
    Ok(())
}

fn error_message(error: &Option<String>) -> String {
    error.clone().unwrap_or_else(|| "Unknown error".into())
}

/// Send a request and decode the response envelope, whatever the status
async fn send<T: DeserializeOwned>(request: RequestBuilder, url: &str) -> Result<ApiResponse<T>> {
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .context("Failed to read response body")?;
    serde_json::from_str(&text)
        .map_err(|_| anyhow!("Request to {} failed: {} {}", url, status, text))
}

/// Send a request and return its data, turning an unsuccessful envelope into an error
async fn fetch<T: DeserializeOwned>(request: RequestBuilder, url: &str) -> Result<T> {
    let response: ApiResponse<T> = send(request, url).await?;
    if !response.success {
        return Err(anyhow!(error_message(&response.error)));
    }
    response
        .data
        .ok_or_else(|| anyhow!("Response from {} is missing data", url))
}
