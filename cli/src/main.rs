use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierscope::config::Config;
use tierscope::tier::Accessibility;

mod commands;

#[derive(Parser)]
#[command(name = "tierscope", version)]
#[command(about = "Filter compilation and tiered aggregation over a search cluster", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "tierscope.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the fields of an index with their kind and nested path
    Fields {
        #[arg(long)]
        index: String,
    },
    /// Compile a JSON filter (and optional sort) into the native query
    Compile {
        #[arg(long)]
        index: String,
        #[arg(long)]
        filter: String,
        #[arg(long)]
        sort: Option<String>,
    },
    /// Numeric statistics or histogram of a field
    Numeric {
        #[arg(long)]
        index: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        start: Option<f64>,
        #[arg(long)]
        end: Option<f64>,
        #[arg(long)]
        step: Option<f64>,
        #[arg(long)]
        bins: Option<i64>,
        /// Caller access token forwarded to the policy service
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "all")]
        accessibility: Accessibility,
    },
    /// Term counts of a field
    Text {
        #[arg(long)]
        index: String,
        #[arg(long)]
        field: String,
        #[arg(long)]
        filter: Option<String>,
        /// Ignore the filter's own clauses on the aggregated field
        #[arg(long, default_value = "false")]
        no_filter_self: bool,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "all")]
        accessibility: Accessibility,
    },
    /// Total number of matching documents
    Count {
        #[arg(long)]
        index: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "all")]
        accessibility: Accessibility,
    },
    /// Resolve the accessible and unaccessible resources of a token
    Scope {
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.config)?;
    let ctx = commands::connect(&config).await?;

    let output = match cli.command {
        Commands::Fields { index } => commands::fields(&ctx, &index)?,
        Commands::Compile {
            index,
            filter,
            sort,
        } => commands::compile(&ctx, &index, &filter, sort.as_deref())?,
        Commands::Numeric {
            index,
            field,
            filter,
            start,
            end,
            step,
            bins,
            token,
            accessibility,
        } => {
            let req = commands::aggregation_request(&field, filter.as_deref(), true)?;
            let req = tierscope::aggregation::AggregationRequest {
                range_step: step,
                bin_count: bins,
                ..req.with_range(start, end)
            };
            commands::numeric(&ctx, &token, &index, &req, accessibility).await?
        }
        Commands::Text {
            index,
            field,
            filter,
            no_filter_self,
            token,
            accessibility,
        } => {
            let req = commands::aggregation_request(&field, filter.as_deref(), !no_filter_self)?;
            commands::text(&ctx, &token, &index, &req, accessibility).await?
        }
        Commands::Count {
            index,
            filter,
            token,
            accessibility,
        } => commands::count(&ctx, &token, &index, filter.as_deref(), accessibility).await?,
        Commands::Scope { token } => commands::scope(&ctx, &token).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
