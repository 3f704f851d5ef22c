use crate::{
    config::Config,
    error::Result,
    ml::build_embedder,
    routes::api_routes,
    services::{
        build_chat_model, AssistantRouter, CatalogQueries, CatalogRepository, CatalogSync,
        ChatOptions, FilterChatService, IndexRepository, RecommendationService,
        RedisSessionBackend, SemanticIndexService, SessionStore, ShopifyClient, SqlAgentService,
    },
};
use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use log::info;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{net::TcpListener, sync::Arc, time::Duration};

/// Open the connection pool and apply pending migrations.
pub async fn connect_database(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready, migrations applied");
    Ok(pool)
}

/// Every service the HTTP layer and the admin CLI share.
#[derive(Clone)]
pub struct AppServices {
    pub catalog: CatalogRepository,
    pub catalog_sync: CatalogSync,
    pub index: SemanticIndexService,
    pub recommendations: RecommendationService,
    pub filter_chat: FilterChatService,
    pub agent: SqlAgentService,
    pub assistant: AssistantRouter,
}

impl AppServices {
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = connect_database(config).await?;
        let catalog = CatalogRepository::new(pool.clone());
        let snapshots = IndexRepository::new(pool);

        let shopify = Arc::new(ShopifyClient::new(config)?);
        let embedder = build_embedder(config)?;
        let chat = build_chat_model(config)?;
        let sessions = Arc::new(SessionStore::new(
            Arc::new(RedisSessionBackend::connect(&config.redis_url).await?),
            Duration::from_secs(config.session_ttl_secs),
        ));

        let options = ChatOptions {
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        };
        let queries: Arc<dyn CatalogQueries> = Arc::new(catalog.clone());

        let index = SemanticIndexService::new(embedder, Arc::clone(&queries), Arc::new(snapshots));
        let recommendations = RecommendationService::new(
            index.clone(),
            Arc::clone(&queries),
            Arc::clone(&chat),
            options,
            config.search_top_k,
        );

        Ok(Self {
            catalog_sync: CatalogSync::new(shopify, catalog.clone()),
            filter_chat: FilterChatService::new(
                Arc::clone(&queries),
                Arc::clone(&chat),
                Arc::clone(&sessions),
                options,
            ),
            agent: SqlAgentService::new(Arc::clone(&queries), Arc::clone(&chat), sessions, config),
            assistant: AssistantRouter::new(queries, chat, options),
            catalog,
            index,
            recommendations,
        })
    }
}

pub struct Application {
    port: u16,
    host: String,
    config: Config,
}

impl Application {
    /// Create a new application instance
    pub fn new(config: &Config) -> Self {
        Self {
            port: config.port,
            host: config.host.clone(),
            config: config.clone(),
        }
    }

    /// Build and run the server
    pub async fn run(&self) -> Result<()> {
        let bind_address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_address)?;
        info!("Starting server at http://{}", bind_address);

        self.run_with_listener(listener).await
    }

    /// Run the server with a specific TCP listener
    /// This is useful for testing where we want to use a random port
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let services = AppServices::build(&self.config).await?;

        let catalog = web::Data::new(services.catalog);
        let catalog_sync = web::Data::new(services.catalog_sync);
        let index = web::Data::new(services.index);
        let recommendations = web::Data::new(services.recommendations);
        let filter_chat = web::Data::new(services.filter_chat);
        let agent = web::Data::new(services.agent);
        let assistant = web::Data::new(services.assistant);

        HttpServer::new(move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header();

            App::new()
                .wrap(cors)
                .wrap(Logger::default())
                .app_data(catalog.clone())
                .app_data(catalog_sync.clone())
                .app_data(index.clone())
                .app_data(recommendations.clone())
                .app_data(filter_chat.clone())
                .app_data(agent.clone())
                .app_data(assistant.clone())
                .service(api_routes())
        })
        .listen(listener)?
        .run()
        .await?;

        Ok(())
    }
}
