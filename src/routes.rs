use actix_web::{web, Scope};

use crate::handlers::{
    catalog_config, chat_config, health_check, prewarm_endpoint, recommendations_config,
};

/// Configure all routes for the API
pub fn api_routes() -> Scope {
    web::scope("/api")
        .service(health_check)
        .service(prewarm_endpoint)
        .configure(catalog_config)
        .configure(recommendations_config)
        .configure(chat_config)
}
