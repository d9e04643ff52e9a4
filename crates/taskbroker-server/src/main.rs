mod auth;
mod serve_cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskbroker_core::BrokerConfig;
use taskbroker_db::{pool, DbConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskbroker", about = "Task-dispatch broker for a fleet of autonomous agents")]
struct Cli {
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[arg(long, global = true)]
    bind_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP admission surface and the dispatch loop.
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Exclude an agent from assignment without affecting its in-flight work.
    Drain {
        agent_id: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Re-admit a previously drained agent.
    Undrain {
        agent_id: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Print broker-wide task and backlog counts.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = BrokerConfig::resolve(cli.database_url.clone(), cli.bind_addr.clone())
        .context("failed to resolve configuration")?;
    let db_config = DbConfig::new(config.database_url.clone());

    match cli.command {
        Command::Serve => {
            pool::ensure_database_exists(&db_config).await?;
            let db_pool = pool::create_pool(&db_config).await?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
            serve_cmd::run(config, db_pool).await?;
        }
        Command::Migrate => {
            pool::ensure_database_exists(&db_config).await?;
            let db_pool = pool::create_pool(&db_config).await?;
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
            let counts = pool::table_counts(&db_pool).await?;
            for (table, count) in counts {
                println!("{table}: {count} rows");
            }
        }
        Command::Drain { agent_id, reason, actor } => {
            let db_pool = pool::create_pool(&db_config).await?;
            taskbroker_db::queries::autonomy::set_drained(&db_pool, &agent_id, &reason, &actor).await?;
            println!("drained {agent_id}");
        }
        Command::Undrain { agent_id, actor } => {
            let db_pool = pool::create_pool(&db_config).await?;
            taskbroker_db::queries::autonomy::clear_drained(&db_pool, &agent_id, &actor).await?;
            println!("undrained {agent_id}");
        }
        Command::Stats => {
            let db_pool = pool::create_pool(&db_config).await?;
            let stats = taskbroker_db::queries::stats::summarize(&db_pool).await?;
            println!("tasks by status:");
            for (status, count) in stats.tasks_by_status {
                println!("  {status}: {count}");
            }
            println!("backlog by status:");
            for (status, count) in stats.backlog_by_status {
                println!("  {status}: {count}");
            }
            println!("drained agents: {}", stats.drained_agent_count);
        }
    }

    Ok(())
}
