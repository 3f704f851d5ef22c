use log::info;
use shopify_recommend_api::{app::Application, logging, Config, Result};

#[actix_web::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenv::dotenv().ok();

    logging::init();

    info!("Loading configuration...");
    let config = Config::load()?;

    // Create and run application
    let application = Application::new(&config);
    application.run().await
}
