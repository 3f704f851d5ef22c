//! Admin commands for operating the catalog outside the HTTP server.

use crate::{
    app::AppServices,
    config::Config,
    error::Result,
    models::CatalogSource,
};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

#[derive(Parser)]
#[command(name = "catalog-admin")]
#[command(about = "Catalog sync and semantic index administration", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Fetch products from Shopify and upsert them into the database
    Sync {
        #[arg(long, value_enum, default_value_t = SourceArg::Graphql)]
        source: SourceArg,
    },
    /// Embed every product variant and store a new index snapshot
    RebuildIndex,
    /// Query the latest index without calling the LLM
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    Rest,
    Graphql,
}

impl From<SourceArg> for CatalogSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::Rest => CatalogSource::Rest,
            SourceArg::Graphql => CatalogSource::Graphql,
        }
    }
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .progress_chars("##-"),
    );
    pb
}

pub async fn run(cli: Cli, config: &Config) -> Result<()> {
    let services = AppServices::build(config).await?;

    match cli.cmd {
        Cmd::Sync { source } => {
            info!("Syncing catalog from Shopify ({:?})", source);
            let report = services.catalog_sync.sync(source.into()).await?;
            println!(
                "{} {} products, {} variants ({} skipped)",
                style("Synced").green().bold(),
                report.products,
                report.variants,
                report.skipped_variants
            );
        }
        Cmd::RebuildIndex => {
            let pb = progress_bar();
            let report = services
                .index
                .rebuild_with_progress(|done, total| {
                    pb.set_length(total as u64);
                    pb.set_position(done as u64);
                })
                .await?;
            pb.finish_and_clear();

            println!(
                "{} snapshot {}: {} vectors, dimension {}, model {}",
                style("Built").green().bold(),
                report.snapshot_id,
                report.vectors,
                report.dimension,
                report.model
            );
        }
        Cmd::Search { query, top_k } => {
            let results = services.recommendations.search(&query, top_k).await?;
            if results.is_empty() {
                println!("{}", style("No matches").yellow());
            }
            for (rank, hit) in results.iter().enumerate() {
                println!(
                    "{:>2}. {} {}",
                    rank + 1,
                    style(format!("{:.4}", hit.distance)).dim(),
                    hit.product.search_text()
                );
            }
        }
    }

    Ok(())
}
