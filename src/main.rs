//! Explora CLI - explore collections of a local data directory
//!
//! ```text
//! data/
//!   collections/   {name}.yaml descriptors
//!   indices/       {index}.json mapping, documents and aliases
//! ```

use clap::{Args, Parser, Subcommand};
use explora::storage::{FileDescriptorStore, MemoryBackend};
use explora::{
    AggregateParams, AggregationNode, CallerContext, Explorer, ExplorerConfig, Filters, GeoCell,
    SearchParams,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "explora")]
#[command(about = "Explore and aggregate collections of a document store", long_about = None)]
struct Cli {
    /// Data directory (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    data: PathBuf,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Column filter header: comma-separated `path` or `collection:path` entries
    #[arg(long)]
    columns: Option<String>,

    /// Organisations of the caller, comma separated
    #[arg(long)]
    organisations: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Filter expression `field:op:value`, repeatable (AND-ed)
    #[arg(short, long = "filter")]
    filters: Vec<String>,

    /// Full-text clause `text` or `field:text`, repeatable
    #[arg(short, long = "query")]
    queries: Vec<String>,

    /// Format of the date literals in filters
    #[arg(long)]
    date_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List visible collections
    Collections,

    /// Show a collection and its visible fields
    Describe { collection: String },

    /// Search documents
    Search {
        collection: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Comma-separated include patterns
        #[arg(long)]
        include: Option<String>,

        /// Comma-separated exclude patterns
        #[arg(long)]
        exclude: Option<String>,

        /// Sort specification, e.g. `-ts,id`
        #[arg(long)]
        sort: Option<String>,

        #[arg(long)]
        size: Option<usize>,

        #[arg(long, default_value_t = 0)]
        from: usize,

        /// Sort values of the last hit of the previous page, comma separated
        #[arg(long, conflicts_with = "before")]
        after: Option<String>,

        /// Sort values of the first hit of the next page, comma separated
        #[arg(long)]
        before: Option<String>,
    },

    /// Count matching documents
    Count {
        collection: String,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Bucket documents
    Aggregate {
        collection: String,

        /// Aggregation level `type:field[:key-value]*`, repeatable (nested in order)
        #[arg(short, long = "agg", required = true)]
        aggregations: Vec<String>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Print a single-level map instead of a tree
        #[arg(long)]
        flat: bool,
    },

    /// Bucket documents by geohash or geotile
    GeoAggregate {
        collection: String,

        #[arg(short, long = "agg", required = true)]
        aggregations: Vec<String>,

        /// Geohash or `z/x/y` tile the aggregation is scoped to
        #[arg(long)]
        cell: Option<String>,

        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long)]
        flat: bool,
    },

    /// Compute one metric over matching documents
    Compute {
        collection: String,

        field: String,

        /// avg, sum, min, max, cardinality, geobbox or geocentroid
        function: String,

        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let explorer = open_explorer(&cli.data, cli.config.as_deref())?;
    let ctx = caller_context(&cli);

    match cli.command {
        Commands::Collections => list_collections(&explorer, &ctx).await,
        Commands::Describe { collection } => print_json(&explorer.describe(&collection, &ctx).await?),
        Commands::Search {
            collection,
            filters,
            include,
            exclude,
            sort,
            size,
            from,
            after,
            before,
        } => {
            let params = SearchParams {
                filters: filters.to_filters()?,
                includes: include,
                excludes: exclude,
                sort: sort.as_deref().map(exql::parse_sort).transpose()?.unwrap_or_default(),
                size,
                from,
                after: after.as_deref().map(split_values),
                before: before.as_deref().map(split_values),
            };
            print_json(&explorer.search(&collection, &params, &ctx).await?)
        }
        Commands::Count { collection, filters } => {
            let total = explorer.count(&collection, &filters.to_filters()?, &ctx).await?;
            println!("{}", total);
            Ok(())
        }
        Commands::Aggregate {
            collection,
            aggregations,
            filters,
            flat,
        } => {
            let params = AggregateParams {
                aggregations: exql::parse_aggregations(&aggregations)?,
                filters: filters.to_filters()?,
            };
            let tree = explorer.aggregate(&collection, &params, &ctx).await?;
            print_tree(&explorer, &tree, flat)
        }
        Commands::GeoAggregate {
            collection,
            aggregations,
            cell,
            filters,
            flat,
        } => {
            let params = AggregateParams {
                aggregations: exql::parse_aggregations(&aggregations)?,
                filters: filters.to_filters()?,
            };
            let cell = cell.as_deref().map(GeoCell::parse).transpose()?;
            let tree = explorer
                .geo_aggregate(&collection, &params, cell.as_ref(), &ctx)
                .await?;
            print_tree(&explorer, &tree, flat)
        }
        Commands::Compute {
            collection,
            field,
            function,
            filters,
        } => {
            let function = exql::parse_function(&function)?;
            let result = explorer
                .compute(&collection, &filters.to_filters()?, &field, function, &ctx)
                .await?;
            print_json(&result)
        }
    }
}

fn open_explorer(data: &Path, config: Option<&Path>) -> anyhow::Result<Explorer> {
    let config = match config {
        Some(path) => ExplorerConfig::from_yaml_file(path)?,
        None => ExplorerConfig::default(),
    };
    let store = Arc::new(FileDescriptorStore::open(data.join("collections")));
    let backend = Arc::new(MemoryBackend::load_dir(&data.join("indices"))?);
    Ok(Explorer::new(config, store, backend.clone(), backend)?)
}

fn caller_context(cli: &Cli) -> CallerContext {
    let mut ctx = CallerContext::anonymous();
    if let Some(columns) = &cli.columns {
        ctx = ctx.with_column_filter(columns.clone());
    }
    if let Some(organisations) = &cli.organisations {
        ctx = ctx.with_organisations(split_values(organisations));
    }
    ctx
}

impl FilterArgs {
    fn to_filters(&self) -> anyhow::Result<Filters> {
        Ok(Filters {
            clauses: self
                .filters
                .iter()
                .map(|f| exql::parse_filter(f))
                .collect::<Result<_, _>>()?,
            date_format: self.date_format.clone(),
            full_text: self
                .queries
                .iter()
                .map(|q| exql::parse_full_text(q))
                .collect::<Result<_, _>>()?,
        })
    }
}

fn split_values(csv: &str) -> Vec<String> {
    csv.split(',').map(|v| v.trim().to_string()).collect()
}

async fn list_collections(explorer: &Explorer, ctx: &CallerContext) -> anyhow::Result<()> {
    let collections = explorer.list(ctx).await?;
    if collections.is_empty() {
        println!("No collections found.");
        return Ok(());
    }

    println!("Collections:");
    for descriptor in collections {
        match &descriptor.description {
            Some(description) => println!("  {} ({}) - {}", descriptor.name, descriptor.index_name, description),
            None => println!("  {} ({})", descriptor.name, descriptor.index_name),
        }
    }
    Ok(())
}

fn print_tree(explorer: &Explorer, tree: &AggregationNode, flat: bool) -> anyhow::Result<()> {
    if flat {
        print_json(&explorer.flatten(tree))
    } else {
        print_json(tree)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
