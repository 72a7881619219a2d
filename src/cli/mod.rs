pub mod commands;
pub mod utils;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::config::{self, AppConfig};
use crate::database::Database;
use crate::middleware::{install_defaults, Cancellation};

#[derive(Parser)]
#[command(name = "sqlm")]
#[command(about = "sqlm CLI - run SQL through the database middleware pipeline")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Database URL (defaults to DATABASE_URL)")]
    pub database_url: Option<String>,

    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[arg(long, global = true, help = "Reject statements that do not only read")]
    pub read_only: bool,

    #[arg(long, global = true, help = "Log every database call")]
    pub log_queries: bool,

    #[arg(long, global = true, help = "Give up on each database call after this many milliseconds")]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Check that the database is reachable")]
    Ping,

    #[command(about = "Run a statement and print the rows it returns")]
    Query(SqlArgs),

    #[command(about = "Run a statement and print the number of affected rows")]
    Exec(SqlArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SqlArgs {
    #[arg(help = "SQL text, with $1, $2, ... placeholders")]
    pub sql: String,

    #[arg(long = "arg", help = "Placeholder value as JSON; repeat in order. Non-JSON text is sent as a string")]
    pub args: Vec<String>,

    #[arg(long, help = "Prepare the statement first, then run it")]
    pub prepare: bool,

    #[arg(long, help = "Run inside a transaction and commit it")]
    pub tx: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

impl Cli {
    /// Process configuration with this invocation's switches applied
    pub fn app_config(&self) -> AppConfig {
        let mut app = config::config().clone();
        if let Some(url) = &self.database_url {
            app.database.url = Some(url.clone());
        }
        if self.read_only {
            app.middleware.read_only = true;
        }
        if self.log_queries {
            app.middleware.query_logging = true;
        }
        app
    }

    /// Cancellation applied to every call this invocation makes
    pub fn cancellation(&self) -> Cancellation {
        match self.timeout_ms {
            Some(ms) => Cancellation::timeout(std::time::Duration::from_millis(ms)),
            None => Cancellation::none(),
        }
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let app = cli.app_config();
    let cancel = cli.cancellation();

    let url = app.database.require_url()?;
    let mut db = Database::connect_with(url, &app.database).await?;
    install_defaults(&mut db, &app.middleware)?;

    let result = match cli.command {
        Commands::Ping => commands::ping::handle(&db, &cancel, &output_format).await,
        Commands::Query(args) => commands::sql::query(&db, &cancel, args, &output_format).await,
        Commands::Exec(args) => commands::sql::exec(&db, &cancel, args, &output_format).await,
    };

    db.close().await?;
    result
}
