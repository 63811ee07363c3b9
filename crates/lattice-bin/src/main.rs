//! # latticedb
//!
//! Main entrypoint for the latticedb permissions database.

mod server;
mod termination;

use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lattice_config::Config;
use lattice_observe::{init_logging, LogConfig, LogFormat};
use lattice_store::migrate::HEAD;
use lattice_store::{collect_once, memory_migrations, MemoryDatastore};
use lattice_types::{
    AllowedSubject, ObjectDefinition, Relation, Relationship, RelationshipUpdate, RewriteNode,
    SchemaDefinition,
};
use termination::TerminationError;

#[derive(Parser, Debug)]
#[command(name = "latticedb")]
#[command(about = "A relationship-based permissions database", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "latticedb.yaml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve,
    /// Datastore maintenance operations.
    Datastore {
        #[command(subcommand)]
        operation: DatastoreCommand,
    },
    /// Print the version.
    Version,
    /// Run an ephemeral in-memory server seeded with a sample schema.
    Testserver,
    /// Run the schema language server.
    Lsp,
    /// Serve the schema development tools.
    Devtools,
}

#[derive(Subcommand, Debug)]
enum DatastoreCommand {
    /// Run migrations up to the given revision.
    Migrate {
        #[arg(default_value = HEAD)]
        revision: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the head migration revision.
    Head,
    /// Run one garbage collection cycle.
    Gc,
    /// Run a named repair operation.
    Repair {
        operation: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(termination) = err.downcast_ref::<TerminationError>() {
                eprintln!("{termination}");
                ExitCode::from(termination.exit_code().clamp(1, 255) as u8)
            } else {
                eprintln!("{err:#}");
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = lattice_config::load_or_default(&cli.config);
    init_observability(&config)?;

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Datastore { operation } => datastore_command(&config, operation).await,
        Command::Version => {
            println!("latticedb {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Testserver => testserver(&config).await,
        Command::Lsp | Command::Devtools => Err(TerminationError::new(
            "the schema language tooling is not bundled with this build",
            2,
        )
        .into()),
    }
}

fn init_observability(config: &Config) -> Result<()> {
    let format = match config.observability.log_format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    };
    init_logging(LogConfig {
        format,
        filter: config.observability.log_filter.clone(),
        ..LogConfig::default()
    })
}

async fn serve(config: &Config) -> Result<()> {
    tracing::info!("starting latticedb");
    let handle = server::build(config).await?;

    tracing::info!(
        member_id = %config.dispatch.member_id,
        host = %config.server.host,
        port = config.server.port,
        "serving"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

async fn datastore_command(config: &Config, operation: DatastoreCommand) -> Result<()> {
    match operation {
        DatastoreCommand::Migrate { revision, dry_run } => {
            let datastore = MemoryDatastore::new_unmigrated();
            let manager = memory_migrations()?;
            manager.run(&datastore, &revision, dry_run).await?;
            if dry_run {
                println!("migration plan to `{revision}` is valid");
            } else {
                println!("migrated to `{revision}`");
            }
            Ok(())
        }
        DatastoreCommand::Head => {
            println!("{}", memory_migrations()?.head_revision()?);
            Ok(())
        }
        DatastoreCommand::Gc => {
            let handle = server::build(config).await?;
            let stats = collect_once(handle.datastore.as_ref(), &server::gc_config(config)).await?;
            handle.shutdown();
            println!(
                "garbage collection removed {} relationships and {} transactions",
                stats.relationships_removed, stats.transactions_removed
            );
            Ok(())
        }
        DatastoreCommand::Repair { operation } => {
            let Some(operation) = operation else {
                println!("available repair operations:");
                for op in MemoryDatastore::repair_operations() {
                    println!("  {}: {}", op.name, op.description);
                }
                return Ok(());
            };
            let datastore = MemoryDatastore::new();
            datastore.repair(&operation).await.map_err(|err| {
                TerminationError::new(format!("repair failed: {err}"), 4)
            })?;
            println!("repair `{operation}` complete");
            Ok(())
        }
    }
}

/// An ephemeral stack seeded with a small document-sharing schema, useful
/// for integration work against a running process.
async fn testserver(config: &Config) -> Result<()> {
    let handle = server::build(config).await?;

    handle
        .service
        .write_schema(SchemaDefinition::new(vec![
            ObjectDefinition::new("user", vec![]),
            ObjectDefinition::new(
                "document",
                vec![
                    Relation::direct("viewer", vec![AllowedSubject::direct("user")]),
                    Relation::direct("editor", vec![AllowedSubject::direct("user")]),
                    Relation::permission(
                        "view",
                        RewriteNode::Union(vec![
                            RewriteNode::ComputedUserset { relation: "viewer".to_string() },
                            RewriteNode::ComputedUserset { relation: "editor".to_string() },
                        ]),
                    ),
                ],
            ),
        ]))
        .await?;

    handle
        .service
        .write_relationships(vec![
            RelationshipUpdate::touch(Relationship::new(
                "document", "firstdoc", "viewer", "user", "alice",
            )),
            RelationshipUpdate::touch(Relationship::new(
                "document", "firstdoc", "editor", "user", "bob",
            )),
        ])
        .await?;

    let started = SystemTime::now();
    tracing::info!(?started, "test server ready with sample schema");

    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    Ok(())
}
