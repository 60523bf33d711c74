mod config;
mod git;
mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use git::GitDiffer;
use logging::init_logging;
use pointer_codenav::db::memory::InMemoryIndex;
use pointer_codenav::db::postgres::PostgresStore;
use pointer_codenav::db::{BundleStore, DiffTranslator, UploadDirectory};
use pointer_codenav::{CodeNavService, GitTreeTranslator, LocationsPage, RequestArgs};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "pointer-codenav",
    version,
    about = "Resolve definitions, references, implementations and prototypes from precise indexes"
)]
struct Cli {
    /// TOML file with `[global]`, `[codenav]` and `[[repo]]` sections.
    #[arg(long, env = "POINTER_CODENAV_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// JSON index snapshot served from memory; takes precedence over the database.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Definitions of the symbol under the cursor.
    Definitions(QueryArgs),
    References(QueryArgs),
    Implementations(QueryArgs),
    Prototypes(QueryArgs),
    /// Uploads able to answer queries about a file.
    Uploads(DocumentArgs),
    /// Every indexed range of a file.
    Stencil(DocumentArgs),
    /// Indexed ranges of a line window with their locations.
    Ranges(DocumentArgs),
    /// Apply the database migrations and exit.
    Migrate,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    repository_id: i64,
    #[arg(long)]
    commit: String,
    #[arg(long)]
    path: String,
    /// Zero-based line.
    #[arg(long)]
    line: u32,
    /// Zero-based character.
    #[arg(long)]
    character: u32,
    /// Page size; zero selects the configured default.
    #[arg(long, default_value_t = 0)]
    limit: usize,
    /// Cursor printed by the previous page.
    #[arg(long)]
    cursor: Option<String>,
}

impl QueryArgs {
    fn request(&self) -> RequestArgs {
        RequestArgs {
            repository_id: self.repository_id,
            commit: self.commit.clone(),
            path: self.path.clone(),
            line: self.line,
            character: self.character,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Args)]
struct DocumentArgs {
    #[arg(long)]
    repository_id: i64,
    #[arg(long)]
    commit: String,
    #[arg(long)]
    path: String,
    /// First zero-based line of the window.
    #[arg(long, default_value_t = 0)]
    start_line: u32,
    /// Line after the window; the whole file when omitted.
    #[arg(long)]
    end_line: Option<u32>,
}

impl DocumentArgs {
    fn request(&self) -> RequestArgs {
        RequestArgs {
            repository_id: self.repository_id,
            commit: self.commit.clone(),
            path: self.path.clone(),
            line: 0,
            character: 0,
            limit: 0,
        }
    }
}

enum Backend {
    Postgres(PostgresStore),
    Snapshot(InMemoryIndex),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    info!(
        stage = "startup",
        event = "startup.begin",
        config_path = ?cli.config.as_ref().map(|p| p.display().to_string()),
        "pointer-codenav process starting"
    );

    let cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    tokio::select! {
        result = run(&cli, &cfg) => result,
        _ = signal::ctrl_c() => {
            warn!(stage = "shutdown", event = "shutdown.signal", "interrupted before completion");
            bail!("interrupted");
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let load_start = Instant::now();
    match AppConfig::load(path).context("failed to load pointer-codenav config") {
        Ok(cfg) => {
            info!(
                stage = "startup",
                event = "config.load.end",
                result = "ok",
                config_path = %path.display(),
                repo_count = cfg.repos.len(),
                duration_ms = load_start.elapsed().as_millis(),
                "configuration loaded"
            );
            Ok(cfg)
        }
        Err(err) => {
            error!(
                stage = "startup",
                event = "config.load.end",
                result = "fail",
                config_path = %path.display(),
                duration_ms = load_start.elapsed().as_millis(),
                error = %format!("{err:#}"),
                "configuration load failed"
            );
            Err(err)
        }
    }
}

async fn run(cli: &Cli, cfg: &AppConfig) -> Result<()> {
    let backend = open_backend(cli).await?;

    if let Command::Migrate = &cli.command {
        let Backend::Postgres(store) = backend else {
            bail!("migrate requires --database-url");
        };
        store.migrate().await.context("failed to run migrations")?;
        info!(stage = "migrate", event = "migrate.end", result = "ok", "migrations applied");
        return Ok(());
    }

    let service = build_service(backend, cfg).await?;

    let start = Instant::now();
    let (args, output, returned) = match &cli.command {
        Command::Definitions(query) => {
            let args = query.request();
            let locations = service.get_definitions(&args).await?;
            let page = LocationsPage {
                locations,
                next_cursor: None,
            };
            let returned = page.locations.len();
            (args, to_json(&page)?, returned)
        }
        Command::References(query)
        | Command::Implementations(query)
        | Command::Prototypes(query) => {
            let args = query.request();
            let cursor = query.cursor.as_deref();
            let page = match &cli.command {
                Command::References(_) => service.get_references(&args, cursor).await?,
                Command::Implementations(_) => service.get_implementations(&args, cursor).await?,
                _ => service.get_prototypes(&args, cursor).await?,
            };
            let returned = page.locations.len();
            (args, to_json(&page)?, returned)
        }
        Command::Uploads(document) => {
            let args = document.request();
            let uploads = service.visible_uploads_for_path(&args).await?;
            (args, to_json(&uploads)?, uploads.len())
        }
        Command::Stencil(document) => {
            let args = document.request();
            let stencil = service.get_stencil(&args).await?;
            (args, to_json(&stencil)?, stencil.len())
        }
        Command::Ranges(document) => {
            let args = document.request();
            let end_line = document.end_line.unwrap_or(u32::MAX);
            let ranges = service
                .get_ranges(&args, document.start_line, end_line)
                .await?;
            (args, to_json(&ranges)?, ranges.len())
        }
        Command::Migrate => return Ok(()),
    };
    info!(
        stage = "query",
        event = "query.end",
        result = "ok",
        repository_id = args.repository_id,
        path = %args.path,
        returned,
        duration_ms = start.elapsed().as_millis(),
        "query answered"
    );

    println!("{output}");
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to serialize query result")
}

async fn open_backend(cli: &Cli) -> Result<Backend> {
    if let Some(path) = &cli.snapshot {
        let index = InMemoryIndex::load(path)
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        info!(
            stage = "startup",
            event = "backend.ready",
            backend = "snapshot",
            snapshot = %path.display(),
            "snapshot loaded"
        );
        return Ok(Backend::Snapshot(index));
    }

    let Some(database_url) = &cli.database_url else {
        bail!("either --database-url (or DATABASE_URL) or --snapshot is required");
    };

    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to database")?;
    info!(
        stage = "startup",
        event = "backend.ready",
        backend = "postgres",
        max_connections = cli.max_connections,
        "database pool ready"
    );
    Ok(Backend::Postgres(PostgresStore::new(pool)))
}

async fn build_service(backend: Backend, cfg: &AppConfig) -> Result<CodeNavService> {
    let git_translator = if cfg.repos.is_empty() {
        None
    } else {
        let differ = GitDiffer::new(cfg.global.git_bin.clone(), cfg.repo_dirs());
        differ
            .validate_binary_exists()
            .await
            .context("git binary check failed")?;
        Some(Arc::new(GitTreeTranslator::new(differ)) as Arc<dyn DiffTranslator>)
    };

    let (store, directory, translator): (
        Arc<dyn BundleStore>,
        Arc<dyn UploadDirectory>,
        Arc<dyn DiffTranslator>,
    ) = match backend {
        Backend::Postgres(store) => {
            let Some(translator) = git_translator else {
                bail!("at least one [[repo]] checkout is required to translate positions");
            };
            (Arc::new(store.clone()), Arc::new(store), translator)
        }
        Backend::Snapshot(index) => {
            let translator = git_translator
                .unwrap_or_else(|| Arc::new(GitTreeTranslator::new(index.clone())) as Arc<dyn DiffTranslator>);
            (Arc::new(index.clone()), Arc::new(index), translator)
        }
    };

    Ok(CodeNavService::new(
        store,
        directory,
        translator,
        cfg.codenav.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_query() {
        let cli = Cli::try_parse_from([
            "pointer-codenav",
            "--snapshot",
            "index.json",
            "references",
            "--repository-id",
            "7",
            "--commit",
            "abc",
            "--path",
            "src/main.rs",
            "--line",
            "3",
            "--character",
            "9",
            "--cursor",
            "token",
        ])
        .expect("parse cli");

        let Command::References(query) = &cli.command else {
            panic!("expected references, got {:?}", cli.command);
        };
        let args = query.request();
        assert_eq!(args.repository_id, 7);
        assert_eq!(args.position().line, 3);
        assert_eq!(args.limit, 0);
        assert_eq!(query.cursor.as_deref(), Some("token"));
    }

    #[test]
    fn migrate_takes_no_query_arguments() {
        let cli = Cli::try_parse_from(["pointer-codenav", "-vv", "migrate"]).expect("parse cli");
        assert!(matches!(cli.command, Command::Migrate));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn query_requires_position() {
        let err = Cli::try_parse_from([
            "pointer-codenav",
            "definitions",
            "--repository-id",
            "7",
            "--commit",
            "abc",
            "--path",
            "src/main.rs",
        ])
        .expect_err("missing line and character");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn ranges_window_defaults_to_whole_file() {
        let cli = Cli::try_parse_from([
            "pointer-codenav",
            "ranges",
            "--repository-id",
            "7",
            "--commit",
            "abc",
            "--path",
            "src/main.rs",
        ])
        .expect("parse cli");

        let Command::Ranges(document) = &cli.command else {
            panic!("expected ranges, got {:?}", cli.command);
        };
        assert_eq!(document.start_line, 0);
        assert_eq!(document.end_line, None);
        assert_eq!(document.request().position().line, 0);
    }
}
