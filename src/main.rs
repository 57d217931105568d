//! Rowguard policy tool
//!
//! Validates policy files and shows how queries are rewritten for a given
//! identity.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rowguard::common::{Operation, RowGuardConfig, SqlValue};
use rowguard::rls::context::RlsContext;
use rowguard::RowGuard;

#[derive(Parser, Debug)]
#[command(name = "rowguard")]
#[command(about = "Declarative row-level access control for SQL", long_about = None)]
struct Args {
    /// Path to the policy file
    #[arg(short, long, env = "ROWGUARD_CONFIG", default_value = "rowguard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the policy file and report what it registers
    Check,

    /// Print the rewritten SQL and parameters for one caller
    Explain {
        /// Protected table (ignored when --sql is given)
        #[arg(short, long)]
        table: Option<String>,

        /// Operation: create, read, update or delete
        #[arg(short, long, default_value = "read")]
        operation: Operation,

        /// Raw SQL to rewrite instead of `SELECT * FROM <table>`
        #[arg(long)]
        sql: Option<String>,

        /// Bound parameters of --sql, as JSON values
        #[arg(long = "param")]
        params: Vec<String>,

        /// Caller id; omit for an anonymous caller
        #[arg(short, long)]
        user: Option<String>,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(short, long = "role")]
        roles: Vec<String>,

        /// Extra context values as key=value (value parsed as JSON if possible)
        #[arg(short, long = "metadata")]
        metadata: Vec<String>,

        /// Run as the system context
        #[arg(long)]
        system: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("rowguard v{}", env!("CARGO_PKG_VERSION"));

    if !args.config.exists() {
        anyhow::bail!("policy file {} not found", args.config.display());
    }
    let config = RowGuardConfig::from_file(&args.config)?;
    let engine = RowGuard::from_config(config)?;

    match args.command {
        Command::Check => check(&engine),
        Command::Explain {
            table,
            operation,
            sql,
            params,
            user,
            tenant,
            roles,
            metadata,
            system,
        } => {
            let context = if system {
                RlsContext::system()
            } else {
                build_context(user, tenant, roles, &metadata)?
            };
            let params = params
                .iter()
                .map(|raw| parse_param(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let rewritten = engine
                .run_as(context, async {
                    match (&sql, &table) {
                        (Some(sql), _) => engine.rewrite_sql(sql, params).await,
                        (None, Some(table)) => engine
                            .rewrite(engine.select(table), table, operation)
                            .await
                            .map(|query| query.to_sql()),
                        (None, None) => Err(rowguard::common::Error::QueryError(
                            "either --table or --sql is required".to_string(),
                        )),
                    }
                })
                .await?;

            println!("{}", rewritten.sql);
            println!("{}", serde_json::to_string(&rewritten.params)?);
            Ok(())
        }
    }
}

fn check(engine: &RowGuard) -> anyhow::Result<()> {
    println!("dialect: {}", engine.dialect());
    for table in engine.registry().tables() {
        println!("table {table}");
        for operation in Operation::ALL {
            let rules = engine.registry().get_rules(&table, operation);
            if rules.is_empty() {
                continue;
            }
            let names: Vec<String> = rules
                .iter()
                .map(|r| format!("{}({}, priority {})", r.name, r.kind.label(), r.priority))
                .collect();
            println!("  {operation}: {}", names.join(", "));
        }
    }
    Ok(())
}

fn build_context(
    user: Option<String>,
    tenant: Option<String>,
    roles: Vec<String>,
    metadata: &[String],
) -> anyhow::Result<RlsContext> {
    let mut context = match user {
        Some(user) => RlsContext::authenticated(&user, roles),
        None => roles
            .iter()
            .fold(RlsContext::anonymous(), |ctx, role| ctx.with_role(role)),
    };
    if let Some(tenant) = tenant {
        context = context.with_tenant(&tenant);
    }
    for entry in metadata {
        let Some((key, raw)) = entry.split_once('=') else {
            anyhow::bail!("metadata must be key=value, got '{entry}'");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
        context = context.with_metadata(key, value);
    }
    Ok(context)
}

fn parse_param(raw: &str) -> anyhow::Result<SqlValue> {
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw));
    Ok(SqlValue::from_json("param", &value)?)
}
