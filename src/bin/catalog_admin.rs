use clap::Parser;
use shopify_recommend_api::{logging, scripts::catalog_admin::{run, Cli}, Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    let config = Config::load()?;
    run(cli, &config).await
}
