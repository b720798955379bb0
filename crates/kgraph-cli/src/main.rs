//! kgraph CLI - per-agent conversational knowledge graph

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kgraph_core::application::{KnowledgeGraphService, MaintenanceTask};
use kgraph_core::config::GraphConfig;
use kgraph_core::domain::graph::ExchangeWrite;
use kgraph_core::domain::search::{SearchQuery, SearchResponse};
use kgraph_core::infrastructure::graph::SqliteTripleStore;
use kgraph_core::storage::AgentDatabases;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Service = KnowledgeGraphService<SqliteTripleStore>;

#[derive(Parser)]
#[command(name = "kgraph")]
#[command(author, version, about = "Per-agent conversational knowledge graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Agent whose graph to use
    #[arg(short, long, global = true, default_value = "main")]
    agent: String,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest extracted exchanges from a JSON file (object or array)
    Ingest { file: PathBuf },

    /// Rank exchanges related to seed entities
    Search {
        /// Seed entity names
        #[arg(required = true)]
        entities: Vec<String>,
        /// Maximum traversal depth
        #[arg(long)]
        hops: Option<u32>,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Search using the known entities mentioned in free text
    SearchText {
        text: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show an entity with its relationships and co-occurrences
    Entity { name: String },

    /// Resolve a mention against known entities
    Resolve {
        mention: String,
        /// Other entity names from the same exchange
        #[arg(short, long, value_delimiter = ',')]
        context: Vec<String>,
    },

    /// Merge one entity into another
    Merge { keep: String, merge: String },

    /// List meta-path patterns
    Patterns {
        /// Include retired patterns
        #[arg(long)]
        all: bool,
    },

    /// Run maintenance (decay, pending, discover, validate or all)
    Maintain {
        #[arg(default_value = "all")]
        task: String,
        /// Ignore the minimum interval between runs
        #[arg(short, long)]
        force: bool,
    },

    /// Show graph statistics
    Stats,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kgraph=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        command => run(command, &cli.agent, cli.format).await,
    }
}

async fn run(command: Commands, agent: &str, format: OutputFormat) -> anyhow::Result<()> {
    let service = open_service(agent).await?;

    match command {
        Commands::Ingest { file } => cmd_ingest(&service, agent, &file, format).await,
        Commands::Search {
            entities,
            hops,
            limit,
        } => {
            let mut query = SearchQuery::new(agent, entities);
            query.max_hops = hops;
            query.limit = limit;
            let response = service.search(&query).await?;
            print_search(&response, format)
        }
        Commands::SearchText { text, limit } => {
            let response = service.search_text(&text, agent, limit).await?;
            print_search(&response, format)
        }
        Commands::Entity { name } => cmd_entity(&service, agent, &name, format).await,
        Commands::Resolve { mention, context } => {
            cmd_resolve(&service, agent, &mention, &context, format).await
        }
        Commands::Merge { keep, merge } => {
            let rewritten = service.merge_entities(&keep, &merge, agent).await?;
            if format == OutputFormat::Json {
                return print_json(&serde_json::json!({
                    "kept": keep,
                    "merged": merge,
                    "triplesRewritten": rewritten,
                }));
            }
            println!("Merged '{}' into '{}' ({} triples rewritten)", merge, keep, rewritten);
            Ok(())
        }
        Commands::Patterns { all } => cmd_patterns(&service, agent, all, format).await,
        Commands::Maintain { task, force } => {
            cmd_maintain(&service, agent, &task, force, format).await
        }
        Commands::Stats => cmd_stats(&service, agent, format).await,
        Commands::Config { action } => cmd_config(action),
    }
}

async fn open_service(agent: &str) -> anyhow::Result<Service> {
    let config = GraphConfig::load()?;
    config.validate().context("Invalid configuration")?;

    let data_dir = config.storage.resolved_data_dir();
    debug!(data_dir = %data_dir.display(), agent = agent, "Opening graph store");
    let databases =
        AgentDatabases::new(data_dir).max_connections(config.storage.max_connections);
    KnowledgeGraphService::open(&databases, agent, config).await
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Parse one exchange object or an array of them, filling a missing agent id
fn parse_exchanges(raw: &str, agent: &str) -> anyhow::Result<Vec<ExchangeWrite>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("Ingest file is not JSON")?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .map(|mut item| {
            if let Some(object) = item.as_object_mut() {
                object
                    .entry("agentId")
                    .or_insert_with(|| serde_json::Value::String(agent.to_string()));
            }
            serde_json::from_value::<ExchangeWrite>(item).context("Malformed exchange")
        })
        .collect()
}

async fn cmd_ingest(
    service: &Service,
    agent: &str,
    file: &Path,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let writes = parse_exchanges(&raw, agent)?;

    let mut reports = Vec::with_capacity(writes.len());
    for write in writes {
        if write.agent_id != agent {
            bail!(
                "Exchange '{}' belongs to agent '{}'; rerun with --agent {}",
                write.source_exchange_id,
                write.agent_id,
                write.agent_id
            );
        }
        reports.push(service.ingest(write).await?);
    }
    info!(agent = agent, exchanges = reports.len(), "Ingest complete");

    if format == OutputFormat::Json {
        return print_json(&reports);
    }
    for report in &reports {
        println!(
            "{}: {} triples written ({} rewritten, {} pending)",
            report.source_exchange_id,
            report.triple_ids.len(),
            report.rewritten(),
            report.pending_triples
        );
        for hint in &report.hints {
            println!("  ? {}", hint);
        }
    }
    Ok(())
}

fn print_search(response: &SearchResponse, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(response);
    }
    if response.is_empty() {
        println!("No related exchanges.");
        return Ok(());
    }

    println!("Entities: {}", response.entities.join(", "));
    for hit in &response.exchanges {
        println!(
            "  {:.3}  {}  (shared: {})",
            hit.score,
            hit.id,
            hit.shared_entities.join(", ")
        );
    }
    Ok(())
}

async fn cmd_entity(
    service: &Service,
    agent: &str,
    name: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let Some(context) = service.entity_context(name, agent).await? else {
        return Err(kgraph_core::Error::EntityNotFound(name.to_string()).into());
    };
    if format == OutputFormat::Json {
        return print_json(&context);
    }

    let entity = &context.entity;
    println!("{} ({})", entity.canonical_name, entity.entity_type);
    println!("  ID: {}", entity.id);
    println!("  Mentions: {}", entity.mention_count);
    println!("  Last seen: {}", entity.last_seen.format("%Y-%m-%d %H:%M:%S"));
    if !entity.aliases.is_empty() {
        println!("  Aliases: {}", entity.aliases.join(", "));
    }

    for (predicate, triples) in &context.relationships {
        println!("  {}:", predicate);
        for triple in triples {
            let pending = if triple.pending_resolution { " [pending]" } else { "" };
            println!(
                "    {} -> {} ({:.2}){}",
                triple.subject, triple.object, triple.confidence, pending
            );
        }
    }

    if !context.cooccurrences.is_empty() {
        println!("  Seen with:");
        for pair in &context.cooccurrences {
            if let Some(partner) = pair.partner_of(&entity.id) {
                println!("    {} ({}x)", partner, pair.count);
            }
        }
    }
    Ok(())
}

async fn cmd_resolve(
    service: &Service,
    agent: &str,
    mention: &str,
    context: &[String],
    format: OutputFormat,
) -> anyhow::Result<()> {
    let resolution = service.resolve(mention, agent, context).await?;
    if format == OutputFormat::Json {
        return print_json(&resolution);
    }

    println!(
        "{} -> {} [{}] ({:.2})",
        resolution.mention,
        resolution.entity_id.as_deref().unwrap_or("-"),
        resolution.tier,
        resolution.confidence
    );
    for candidate in &resolution.candidates {
        println!(
            "  {:.2}  {} ({} mentions)",
            candidate.score, candidate.entity_id, candidate.mention_count
        );
    }
    if let Some(note) = &resolution.note {
        println!("  {}", note);
    }
    Ok(())
}

async fn cmd_patterns(
    service: &Service,
    agent: &str,
    include_inactive: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let patterns = service.list_patterns(agent, include_inactive).await?;
    if format == OutputFormat::Json {
        return print_json(&patterns);
    }
    if patterns.is_empty() {
        println!("No patterns.");
        return Ok(());
    }

    for pattern in &patterns {
        let status = if pattern.active { "" } else { " [retired]" };
        println!(
            "  {}  [{}] weight {:.2}, yield {}, overlap {:.2}{}",
            pattern.template,
            pattern.pattern_type.as_str(),
            pattern.weight,
            pattern.yield_score,
            pattern.overlap_ratio,
            status
        );
    }
    Ok(())
}

async fn cmd_maintain(
    service: &Service,
    agent: &str,
    task: &str,
    force: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let tasks: Vec<MaintenanceTask> = if task.eq_ignore_ascii_case("all") {
        MaintenanceTask::all().to_vec()
    } else {
        match MaintenanceTask::parse(task) {
            Some(task) => vec![task],
            None => bail!(
                "Unknown maintenance task '{}': use decay, pending, discover, validate or all",
                task
            ),
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let report = service.run_tasks(agent, &tasks, force, &cancel).await?;
    if format == OutputFormat::Json {
        return print_json(&report);
    }

    if let Some(decayed) = report.decayed {
        println!("Decay: {} triples halved", decayed);
    }
    if let Some(pending) = &report.pending {
        println!(
            "Pending: {} resolved, {} expired, {} remaining",
            pending.resolved, pending.expired, pending.remaining
        );
    }
    if let Some(discovery) = &report.discovery {
        println!(
            "Discovery: {} candidates, {} evaluated, {} saved{}",
            discovery.candidates,
            discovery.evaluated,
            discovery.saved.len(),
            if discovery.cancelled { " (cancelled)" } else { "" }
        );
        for saved in &discovery.saved {
            println!("  + {}", saved);
        }
    }
    if let Some(validation) = &report.validation {
        println!(
            "Validation: {} checked, {} refreshed, {} retired",
            validation.checked,
            validation.refreshed,
            validation.deactivated.len()
        );
    }
    for skipped in &report.skipped {
        println!("Skipped {} (ran recently; use --force)", skipped);
    }
    Ok(())
}

async fn cmd_stats(service: &Service, agent: &str, format: OutputFormat) -> anyhow::Result<()> {
    let stats = service.stats(agent).await?;
    if format == OutputFormat::Json {
        return print_json(&stats);
    }

    println!("Graph for agent '{}'", agent);
    println!("  Entities:        {}", stats.total_entities);
    println!("  Triples:         {}", stats.total_triples);
    println!("  Pending:         {}", stats.pending_triples);
    println!("  Co-occurrences:  {}", stats.total_cooccurrences);
    println!("  Active patterns: {}", stats.active_patterns);
    println!("  Avg confidence:  {:.3}", stats.average_confidence);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = GraphConfig::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = GraphConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }
        ConfigAction::List => {
            let config = GraphConfig::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            GraphConfig::reset()?;
            println!("Configuration reset to defaults.");
        }
        ConfigAction::Path => {
            println!("{}", GraphConfig::config_path()?.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exchanges_fills_agent() {
        let raw = r#"[
            {"sourceExchangeId": "ex-1", "triples": [{"subject": "Chris", "predicate": "knows", "object": "Dan"}]},
            {"agentId": "other", "sourceExchangeId": "ex-2"}
        ]"#;
        let writes = parse_exchanges(raw, "main").unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].agent_id, "main");
        assert_eq!(writes[0].triples.len(), 1);
        assert_eq!(writes[1].agent_id, "other");

        let single = parse_exchanges(r#"{"sourceExchangeId": "ex-3"}"#, "main").unwrap();
        assert_eq!(single[0].source_exchange_id, "ex-3");
        assert!(parse_exchanges("not json", "main").is_err());
    }
}
