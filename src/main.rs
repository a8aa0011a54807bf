use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};

use newsintel::analysis::{self, Analyzer, Provider};
use newsintel::config::Config;
use newsintel::ingest::{self, opml, Fetcher, NormalizedItem};
use newsintel::storage::{
    Category, Database, DatabaseError, NewSource, PolicyParams, PolicyScope, Schedule, SourceKind,
    SourceUpdate,
};
use newsintel::util::{strip_control_chars, truncate_to_width, validate_url};

/// Column width for titles in list output.
const TITLE_WIDTH: usize = 60;

#[derive(Parser, Debug)]
#[command(
    name = "newsintel",
    version,
    about = "Collect news from feeds, GitHub repositories and README pages, then digest it with an LLM"
)]
struct Args {
    /// Database file (defaults to the config value, then ~/.config/newsintel/newsintel.db)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file (defaults to ~/.config/newsintel/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage sources
    #[command(subcommand)]
    Source(SourceCommand),
    /// Manage categories
    #[command(subcommand)]
    Category(CategoryCommand),
    /// Manage summarization policies
    #[command(subcommand)]
    Policy(PolicyCommand),
    /// Fetch one source, or every active source with --all
    Fetch {
        source_id: Option<i64>,
        #[arg(long, conflicts_with = "source_id")]
        all: bool,
        /// With --all, only fetch sources whose schedule is due
        #[arg(long, requires = "all")]
        due: bool,
    },
    /// Show recent fetch runs of a source
    History { source_id: i64 },
    /// Generate (or regenerate) the daily digest of a source
    Digest {
        source_id: i64,
        /// UTC day, defaults to today
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// List stored digests
    Digests {
        #[arg(long)]
        source: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Analyze ad-hoc text without storing it
    Analyze {
        #[arg(long, conflicts_with = "text", required_unless_present = "text")]
        file: Option<PathBuf>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long, default_value = "Ad-hoc input")]
        source_name: String,
        #[arg(long)]
        focus: Option<String>,
    },
    /// Full-text search over stored items
    Search { query: String },
    /// Most frequent authors and tags
    Entities {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Report configuration and credential status
    Doctor,
}

#[derive(Subcommand, Debug)]
enum SourceCommand {
    /// Register a source
    Add {
        /// Feed URL, GitHub repository URL or page / README URL
        handle: String,
        #[arg(long)]
        name: String,
        /// rss, github_repo or html
        #[arg(long, default_value = "rss")]
        kind: SourceKind,
        /// hourly, daily, weekly or manual
        #[arg(long, default_value = "daily")]
        schedule: Schedule,
        /// Free-text analysis focus passed to the LLM
        #[arg(long)]
        focus: Option<String>,
        #[arg(long)]
        policy: Option<i64>,
    },
    List,
    Show { id: i64 },
    Edit {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        handle: Option<String>,
        #[arg(long)]
        schedule: Option<Schedule>,
        #[arg(long, conflicts_with = "clear_focus")]
        focus: Option<String>,
        #[arg(long)]
        clear_focus: bool,
        /// Re-enabling a source also resets its failure counter
        #[arg(long)]
        active: Option<bool>,
    },
    Remove { id: i64 },
    /// Import subscriptions from an OPML file; folders become categories
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum CategoryCommand {
    Add {
        name: String,
        #[arg(long)]
        parent: Option<i64>,
    },
    List,
    Rename { id: i64, name: String },
    Remove { id: i64 },
    Assign { source_id: i64, category_id: i64 },
    Unassign { source_id: i64, category_id: i64 },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// global, category or source
        #[arg(long, default_value = "global")]
        scope: PolicyScope,
        /// JSON params document; omitted sections take defaults
        #[arg(long, conflicts_with = "params_file")]
        params: Option<String>,
        #[arg(long)]
        params_file: Option<PathBuf>,
    },
    List,
    Show { id: i64 },
    Remove { id: i64 },
    /// Attach a policy to a source; omit the policy to detach
    Attach { source_id: i64, policy_id: Option<i64> },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

/// Sanitize untrusted text for terminal output.
fn clean(s: &str) -> String {
    strip_control_chars(s).into_owned()
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Handles may omit the scheme; validate the normalized form.
fn checked_handle(handle: &str) -> Result<String> {
    let normalized = if handle.contains("://") {
        handle.trim().to_string()
    } else {
        format!("https://{}", handle.trim())
    };
    validate_url(&normalized).with_context(|| format!("Rejected source handle: {}", handle))?;
    Ok(normalized)
}

fn mask(key: Option<SecretString>) -> String {
    match key {
        Some(k) => {
            let prefix: String = k.expose_secret().chars().take(8).collect();
            format!("{prefix}...")
        }
        None => "NOT SET".to_string(),
    }
}

async fn open_db(path: &std::path::Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            // SEC-007: Set directory permissions on Unix (user-only access)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                {
                    tracing::warn!(path = %parent.display(), error = %e, "Failed to set directory permissions to 0700");
                }
            }
        }
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("The database is locked by another newsintel process. Try again when it finishes.")
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(p) => p.clone(),
        None => Config::default_dir()?.join("config.toml"),
    };
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    let db_path = match &args.db {
        Some(p) => p.clone(),
        None => config.database_path()?,
    };

    // Doctor must not create the database file
    if let Command::Doctor = args.command {
        return doctor(&config, &config_path, &db_path);
    }

    let db = open_db(&db_path).await?;

    match args.command {
        Command::Source(cmd) => source_command(&db, cmd).await,
        Command::Category(cmd) => category_command(&db, cmd).await,
        Command::Policy(cmd) => policy_command(&db, cmd).await,
        Command::Fetch {
            source_id,
            all,
            due,
        } => {
            let fetcher = Fetcher::from_config(&config)?;
            if all {
                fetch_all(&db, &fetcher, due, config.fetch_concurrency).await
            } else {
                let id = source_id.context("Pass a source ID or --all")?;
                let outcome = ingest::fetch_and_save(&db, &fetcher, id).await?;
                println!(
                    "Fetched {} items, {} new",
                    outcome.fetched, outcome.new_items
                );
                Ok(())
            }
        }
        Command::History { source_id } => {
            let runs = ingest::fetch_history(&db, source_id).await?;
            if runs.is_empty() {
                println!("No fetch runs for source {}", source_id);
            }
            for run in runs {
                let status = match (run.ended_at, run.ok) {
                    (None, _) => "running",
                    (Some(_), true) => "ok",
                    (Some(_), false) => "failed",
                };
                println!(
                    "#{:<5} {}  {:<7} new={:<4} {}",
                    run.id,
                    format_ts(Some(run.started_at)),
                    status,
                    run.new_items,
                    clean(run.error.as_deref().unwrap_or(""))
                );
            }
            Ok(())
        }
        Command::Digest { source_id, date } => {
            let analyzer = Analyzer::from_config(&config)?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let digest = analysis::generate_daily_digest(&db, &analyzer, source_id, date).await?;
            println!("{}", digest.summary_md);
            println!("{}", digest.insights_md);
            for item in &digest.items {
                println!("- {} <{}>", clean(&item.title), item.url);
            }
            Ok(())
        }
        Command::Digests { source, limit } => {
            for digest in db.list_digests(source, limit).await? {
                let title = digest.summary_md.lines().next().unwrap_or("");
                println!(
                    "{}  source={:<4} items={:<4} {}",
                    digest.date,
                    digest.source_id,
                    digest.items.len(),
                    clean(title)
                );
            }
            Ok(())
        }
        Command::Analyze {
            file,
            text,
            source_name,
            focus,
        } => {
            let content = match (file, text) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(text)) => text,
                (None, None) => anyhow::bail!("Pass --file or --text"),
            };
            let item = NormalizedItem {
                url: "about:adhoc".to_string(),
                title: source_name.clone(),
                author: "Unknown".to_string(),
                published_at: Utc::now().timestamp(),
                content,
                tags: Vec::new(),
                metadata: serde_json::json!({ "type": "adhoc" }),
            };
            let analyzer = Analyzer::from_config(&config)?;
            let result = analyzer
                .analyze_content(&[item], &source_name, focus.as_deref(), None)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Search { query } => {
            let items = db.search_items(&query).await?;
            for item in &items {
                println!(
                    "#{:<6} {}  {}",
                    item.id,
                    format_ts(Some(item.published_at)),
                    truncate_to_width(&clean(&item.title), TITLE_WIDTH)
                );
            }
            println!("{} results", items.len());
            Ok(())
        }
        Command::Entities { limit } => {
            for entity in db.top_entities(limit).await? {
                println!("{:<6} {:>5}  {}", entity.kind.to_string(), entity.count, clean(&entity.name));
            }
            Ok(())
        }
        Command::Doctor => doctor(&config, &config_path, &db_path),
    }
}

async fn fetch_all(db: &Database, fetcher: &Fetcher, due: bool, concurrency: usize) -> Result<()> {
    let results = ingest::fetch_all(db, fetcher, due, concurrency).await?;
    if results.is_empty() {
        println!("Nothing to fetch");
        return Ok(());
    }
    let mut failed = 0;
    for r in &results {
        match &r.result {
            Ok(outcome) => println!("ok     {:<30} new={}", clean(&r.name), outcome.new_items),
            Err(e) => {
                failed += 1;
                println!("failed {:<30} {}", clean(&r.name), e);
            }
        }
    }
    println!("{} sources fetched, {} failed", results.len(), failed);
    Ok(())
}

async fn source_command(db: &Database, cmd: SourceCommand) -> Result<()> {
    match cmd {
        SourceCommand::Add {
            handle,
            name,
            kind,
            schedule,
            focus,
            policy,
        } => {
            let handle = checked_handle(&handle)?;
            let id = db
                .create_source(&NewSource {
                    name,
                    kind,
                    handle,
                    schedule,
                    ai_focus: focus,
                    policy_id: policy,
                })
                .await?;
            println!("Created source {}", id);
        }
        SourceCommand::List => {
            for s in db.list_sources().await? {
                let state = if !s.is_active {
                    "inactive"
                } else if s.consecutive_failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
                    "tripped"
                } else if s.error.is_some() {
                    "error"
                } else {
                    "active"
                };
                println!(
                    "#{:<4} {:<11} {:<7} {:<8} {}  last={}",
                    s.id,
                    s.kind.as_str(),
                    s.schedule.as_str(),
                    state,
                    truncate_to_width(&clean(&s.name), TITLE_WIDTH),
                    format_ts(s.last_fetched)
                );
            }
        }
        SourceCommand::Show { id } => {
            let s = db
                .get_source(id)
                .await?
                .with_context(|| format!("Source {} not found", id))?;
            println!("Name:      {}", clean(&s.name));
            println!("Kind:      {}", s.kind);
            println!("Handle:    {}", s.handle);
            println!("Schedule:  {}", s.schedule);
            println!("Active:    {}", s.is_active);
            println!("Focus:     {}", clean(s.ai_focus.as_deref().unwrap_or("-")));
            println!(
                "Policy:    {}",
                s.policy_id.map_or("-".to_string(), |p| p.to_string())
            );
            println!("Fetched:   {}", format_ts(s.last_fetched));
            println!("Failures:  {}", s.consecutive_failures);
            if let Some(err) = &s.error {
                println!("Error:     {}", clean(err));
            }
            let categories: Vec<String> = db
                .categories_for_source(id)
                .await?
                .into_iter()
                .map(|c| clean(&c.name))
                .collect();
            println!("Categories: {}", categories.join(", "));
            println!("Items:     {}", db.count_items(id).await?);
            for item in db.recent_items(id, 5).await? {
                println!(
                    "  {}  {}",
                    format_ts(Some(item.published_at)),
                    truncate_to_width(&clean(&item.title), TITLE_WIDTH)
                );
            }
        }
        SourceCommand::Edit {
            id,
            name,
            handle,
            schedule,
            focus,
            clear_focus,
            active,
        } => {
            let handle = handle.as_deref().map(checked_handle).transpose()?;
            let ai_focus = if clear_focus { Some(None) } else { focus.map(Some) };
            db.update_source(
                id,
                &SourceUpdate {
                    name,
                    handle,
                    schedule,
                    ai_focus,
                    is_active: active,
                },
            )
            .await?;
            println!("Updated source {}", id);
        }
        SourceCommand::Remove { id } => {
            if db.delete_source(id).await? {
                println!("Removed source {}", id);
            } else {
                anyhow::bail!("Source {} not found", id);
            }
        }
        SourceCommand::Import { path } => {
            // SEC-008: Canonicalize to resolve symlinks and prevent path traversal
            let canonical = path
                .canonicalize()
                .with_context(|| format!("Failed to resolve import file: {}", path.display()))?;
            if !std::fs::metadata(&canonical)?.is_file() {
                anyhow::bail!("Import path must be a regular file");
            }
            let path_str = canonical
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
            let entries = opml::parse(path_str).await.context("Failed to parse OPML file")?;
            if entries.is_empty() {
                eprintln!("Warning: No valid feeds found in OPML file");
                return Ok(());
            }
            let summary = opml::import_sources(db, &entries).await?;
            println!(
                "Imported {} sources, created {} categories",
                summary.sources, summary.categories_created
            );
        }
    }
    Ok(())
}

fn print_tree(categories: &[Category]) {
    let mut children: HashMap<Option<i64>, Vec<&Category>> = HashMap::new();
    for c in categories {
        children.entry(c.parent_id).or_default().push(c);
    }
    let mut stack: Vec<(&Category, usize)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|c| (*c, 0)).collect())
        .unwrap_or_default();
    while let Some((cat, depth)) = stack.pop() {
        println!("{}#{:<4} {}", "  ".repeat(depth), cat.id, clean(&cat.name));
        if let Some(kids) = children.get(&Some(cat.id)) {
            stack.extend(kids.iter().rev().map(|c| (*c, depth + 1)));
        }
    }
}

async fn category_command(db: &Database, cmd: CategoryCommand) -> Result<()> {
    match cmd {
        CategoryCommand::Add { name, parent } => {
            let id = db.create_category(&name, parent).await?;
            println!("Created category {}", id);
        }
        CategoryCommand::List => print_tree(&db.get_categories_tree().await?),
        CategoryCommand::Rename { id, name } => {
            db.rename_category(id, &name).await?;
            println!("Renamed category {}", id);
        }
        CategoryCommand::Remove { id } => {
            if !db.delete_category(id).await? {
                anyhow::bail!("Category {} not found", id);
            }
            println!("Removed category {}", id);
        }
        CategoryCommand::Assign {
            source_id,
            category_id,
        } => {
            db.assign_source_category(source_id, category_id).await?;
            println!("Assigned source {} to category {}", source_id, category_id);
        }
        CategoryCommand::Unassign {
            source_id,
            category_id,
        } => {
            if !db.unassign_source_category(source_id, category_id).await? {
                anyhow::bail!("Source {} is not in category {}", source_id, category_id);
            }
            println!("Unassigned source {} from category {}", source_id, category_id);
        }
    }
    Ok(())
}

async fn policy_command(db: &Database, cmd: PolicyCommand) -> Result<()> {
    match cmd {
        PolicyCommand::Add {
            name,
            description,
            scope,
            params,
            params_file,
        } => {
            let raw = match (params, params_file) {
                (Some(json), _) => Some(json),
                (None, Some(path)) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                (None, None) => None,
            };
            let params: PolicyParams = match raw {
                Some(json) => serde_json::from_str(&json).context("Invalid policy params JSON")?,
                None => PolicyParams::default(),
            };
            let id = db
                .create_policy(&name, description.as_deref(), scope, &params)
                .await?;
            println!("Created policy {}", id);
        }
        PolicyCommand::List => {
            for p in db.list_policies().await? {
                println!(
                    "#{:<4} {:<8} {}  {}",
                    p.id,
                    p.scope.as_str(),
                    clean(&p.name),
                    clean(p.description.as_deref().unwrap_or(""))
                );
            }
        }
        PolicyCommand::Show { id } => {
            let p = db
                .get_policy(id)
                .await?
                .with_context(|| format!("Policy {} not found", id))?;
            println!("{} ({})", clean(&p.name), p.scope);
            println!("{}", serde_json::to_string_pretty(&p.params)?);
        }
        PolicyCommand::Remove { id } => {
            if !db.delete_policy(id).await? {
                anyhow::bail!("Policy {} not found", id);
            }
            println!("Removed policy {}", id);
        }
        PolicyCommand::Attach {
            source_id,
            policy_id,
        } => {
            db.set_source_policy(source_id, policy_id).await?;
            match policy_id {
                Some(p) => println!("Attached policy {} to source {}", p, source_id),
                None => println!("Detached policy from source {}", source_id),
            }
        }
    }
    Ok(())
}

fn doctor(config: &Config, config_path: &std::path::Path, db_path: &std::path::Path) -> Result<()> {
    let claude = config.claude_key();
    let openai = config.openai_key();
    let (preferred, model) = match analysis::select_provider(config)? {
        Some((Provider::Claude, _)) => (Provider::Claude.label(), config.claude_model.as_str()),
        Some((Provider::OpenAi, _)) => (Provider::OpenAi.label(), config.openai_model.as_str()),
        None => ("None", "-"),
    };
    println!("Config file:        {}", config_path.display());
    println!("Database:           {}", db_path.display());
    println!("Claude API key:     {}", mask(claude));
    println!("OpenAI API key:     {}", mask(openai));
    println!("GitHub token:       {}", mask(config.github_token()));
    println!("Preferred provider: {}", preferred);
    println!("Model:              {}", model);
    println!("Timestamp:          {}", Utc::now().to_rfc3339());
    Ok(())
}
