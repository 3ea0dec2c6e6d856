use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use searchwire_transport::{
    Method, NodeDescriptor, RequestOptions, RequestParams, Response, ResurrectStrategy, Transport,
    TransportConfig, TransportError,
};

const DEFAULT_NODE: &str = "http://localhost:9200";

#[derive(Parser, Debug)]
#[command(name = "swctl")]
#[command(about = "searchwire cluster client", long_about = None)]
pub struct Cli {
    /// Transport config file (.toml or .json).
    #[arg(short, long, env = "SWCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seed node URL; repeatable, overrides the config file's nodes.
    #[arg(short = 'n', long = "node", env = "SWCTL_NODES", value_delimiter = ',')]
    pub nodes: Vec<String>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// ping, optimistic or none.
    #[arg(long)]
    pub resurrect_strategy: Option<ResurrectStrategy>,

    /// Discover the cluster before running the command.
    #[arg(long)]
    pub sniff_on_start: bool,

    /// Print transport counters when done.
    #[arg(long)]
    pub stats: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request.
    Request {
        method: Method,
        path: String,
        /// Query parameter as key=value; repeatable.
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
        /// Request body.
        #[arg(short, long)]
        data: Option<String>,
        /// Header as name:value; repeatable.
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Status code to accept as success; repeatable.
        #[arg(long = "ignore")]
        ignore: Vec<u16>,
        #[arg(long)]
        opaque_id: Option<String>,
        /// Overall deadline across retries.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Show the answering node's info.
    Info,
    /// Discover the cluster topology and print it.
    Sniff,
    /// List pool members and their health.
    Nodes,
}

fn parse_pair(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name:value, got {:?}", raw))
}

impl Cli {
    /// Config file (or defaults) with command line overrides applied.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => TransportConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TransportConfig::default(),
        };
        if !self.nodes.is_empty() {
            config.nodes = self.nodes.iter().map(NodeDescriptor::new).collect();
        }
        if config.nodes.is_empty() {
            config.nodes.push(NodeDescriptor::new(DEFAULT_NODE));
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.request_timeout_ms = timeout;
        }
        if let Some(strategy) = self.resurrect_strategy {
            config.resurrect_strategy = strategy;
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.transport_config()?;
        tracing::debug!("Using {} seed node(s)", config.nodes.len());
        let transport = Transport::with_reqwest(config)?;
        if self.sniff_on_start {
            let nodes = transport.sniff().await?;
            tracing::info!("Discovered {} node(s)", nodes.len());
        }

        let result = match &self.command {
            Command::Request {
                method,
                path,
                query,
                data,
                headers,
                ignore,
                opaque_id,
                deadline_ms,
            } => {
                let mut params = RequestParams::new(*method, path.clone());
                params.querystring = query.clone();
                if let Some(data) = data {
                    params = params.body(data.clone());
                }
                let mut options = RequestOptions::new();
                options.headers = headers.clone();
                options.ignore_status_codes = ignore.clone();
                options.opaque_id = opaque_id.clone();
                options.deadline = deadline_ms.map(Duration::from_millis);
                send(&transport, params, options).await
            }
            Command::Info => {
                send(
                    &transport,
                    RequestParams::new(Method::Get, "/"),
                    RequestOptions::new(),
                )
                .await
            }
            Command::Sniff => sniff(&transport).await,
            Command::Nodes => {
                print_nodes(&transport);
                Ok(())
            }
        };

        if self.stats {
            let snapshot = transport.metrics().snapshot();
            eprintln!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        result
    }
}

async fn send(transport: &Transport, params: RequestParams, options: RequestOptions) -> Result<()> {
    match transport.request(params, options).await {
        Ok(response) => {
            print_response(&response);
            Ok(())
        }
        Err(TransportError::Response(response)) => {
            print_response(&response);
            anyhow::bail!("request failed with status {}", response.status())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_response(response: &Response) {
    for warning in response.warnings() {
        eprintln!("warning: {}", warning);
    }
    tracing::debug!(
        "{} from {} after {} attempt(s)",
        response.status(),
        response.meta().connection_id,
        response.meta().attempts
    );
    match response.json::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", response.text()),
        },
        Err(_) if response.body().is_empty() => println!("{}", response.status()),
        Err(_) => println!("{}", response.text()),
    }
}

async fn sniff(transport: &Transport) -> Result<()> {
    let nodes = transport.sniff().await?;
    for node in &nodes {
        println!("{}\t{}", node.id.as_deref().unwrap_or("-"), node.url);
    }
    Ok(())
}

fn print_nodes(transport: &Transport) {
    println!("{:<24} {:<32} {:<6} {:>10}", "ID", "URL", "STATUS", "DEAD_COUNT");
    for snap in transport.pool().snapshots() {
        println!(
            "{:<24} {:<32} {:<6} {:>10}",
            snap.connection.id(),
            snap.connection.url().as_str(),
            snap.status,
            snap.dead_count
        );
    }
    let stats = transport.pool().stats();
    println!("{} total, {} alive, {} dead", stats.total, stats.alive, stats.dead);
}
