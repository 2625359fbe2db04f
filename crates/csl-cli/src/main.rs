use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use csl_core::{source_list, LocalSearch, ENTITY_TYPES, SOURCE_LISTS};
use csl_storage::ScreeningStore;
use csl_sync::{connect_store, SearchGateway, SearchRequest, SyncConfig};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "csl-cli")]
#[command(about = "Consolidated Screening List mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Fetch from the upstream API and mirror every result.
    Fetch {
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Audited upstream search; prints the upstream payload.
    Search {
        query: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        user: Option<String>,
        /// Also mirror returned results into the local store.
        #[arg(long)]
        store: bool,
    },
    /// Search the local mirror.
    Local {
        q: Option<String>,
        #[arg(long)]
        source_list: Option<String>,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show recent upstream searches.
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List known source lists and entity types.
    Sources,
    /// List countries present in mirrored addresses.
    Countries,
}

#[derive(Debug, Clone, Args)]
struct FilterArgs {
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    countries: Vec<String>,
    #[arg(long = "types", value_delimiter = ',')]
    entity_types: Vec<String>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fuzzy_name: bool,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    postal_code: Option<String>,
    #[arg(long, default_value_t = 100)]
    size: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

impl FilterArgs {
    fn warn_unknown_sources(&self) {
        for code in &self.sources {
            if source_list(code).is_none() {
                warn!(%code, "unknown source list code");
            }
        }
    }

    fn into_request(self, query: String, user: Option<String>) -> SearchRequest {
        SearchRequest {
            query,
            sources: self.sources,
            countries: self.countries,
            entity_types: self.entity_types,
            fuzzy_name: self.fuzzy_name,
            address: self.address,
            city: self.city,
            state: self.state,
            postal_code: self.postal_code,
            size: self.size,
            offset: self.offset,
            user,
        }
    }
}

/// Target prefix match: covers every `csl_*` crate.
const DEFAULT_LOG_FILTER: &str = "csl=info";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Fetch { name, filters } => {
            filters.warn_unknown_sources();
            let store = connect_store(&config).await?;
            let gateway = SearchGateway::from_config(&config, store)?;
            let params = filters
                .into_request(name.unwrap_or_default(), None)
                .to_params();
            let summary = gateway.fetch_and_store(params).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Search {
            query,
            filters,
            user,
            store: mirror,
        } => {
            filters.warn_unknown_sources();
            let store = connect_store(&config).await?;
            let gateway = SearchGateway::from_config(&config, store)?;
            let request = filters.into_request(query, user);
            let payload = if mirror {
                gateway.external_search(&request).await?
            } else {
                gateway.search(&request).await?
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Local {
            q,
            source_list,
            country,
            limit,
        } => {
            let store = connect_store(&config).await?;
            let hits = store
                .search_local(&LocalSearch {
                    q,
                    source_list,
                    country,
                    limit,
                })
                .await?;
            for entity in hits {
                println!(
                    "{}\t{}\t{}\t{}",
                    entity.external_id,
                    entity.fields.source_list,
                    entity.fields.name,
                    entity
                        .addresses
                        .first()
                        .map(|a| a.display_line())
                        .unwrap_or_default()
                );
            }
        }
        Commands::History { limit } => {
            let store = connect_store(&config).await?;
            for row in store.search_history(limit).await? {
                println!(
                    "{}\t{}\t{} results\t{}",
                    row.timestamp.to_rfc3339(),
                    row.query_text,
                    row.results_count,
                    row.user.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Sources => {
            for list in SOURCE_LISTS {
                println!("{}\t{}\t{}", list.code, list.name, list.agency);
            }
            println!();
            println!("entity types: {}", ENTITY_TYPES.join(", "));
        }
        Commands::Countries => {
            let store = connect_store(&config).await?;
            for country in store.countries().await? {
                println!("{country}");
            }
        }
    }

    Ok(())
}
