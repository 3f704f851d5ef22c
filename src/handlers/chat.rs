use crate::{
    error::ApiError,
    models::{AgentRequest, AssistantRequest, FilterChatRequest},
    services::{AssistantRouter, FilterChatService, SqlAgentService},
};
use actix_web::{
    web::{self, Json},
    HttpResponse,
};
use serde_json::json;

pub fn chat_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/filters/chat").route(web::post().to(filter_chat)))
        .service(web::resource("/v1/filters/{session_id}").route(web::delete().to(reset_filters)))
        .service(web::resource("/v1/agent").route(web::post().to(agent_chat)))
        .service(web::resource("/v1/assistant").route(web::post().to(assistant)));
}

/// One turn of the product-type and budget collection flow
pub async fn filter_chat(
    request: Json<FilterChatRequest>,
    filter_chat: web::Data<FilterChatService>,
) -> Result<HttpResponse, ApiError> {
    let request = request.into_inner();
    if request.message.trim().is_empty() {
        return Err(ApiError::InvalidInput("Message cannot be empty".to_string()));
    }

    let response = filter_chat
        .handle(request.session_id.as_deref(), &request.message)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn reset_filters(
    path: web::Path<String>,
    filter_chat: web::Data<FilterChatService>,
) -> Result<HttpResponse, ApiError> {
    let session_id = path.into_inner();
    let cleared = filter_chat.reset(&session_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "cleared": cleared,
    })))
}

pub async fn agent_chat(
    request: Json<AgentRequest>,
    agent: web::Data<SqlAgentService>,
) -> Result<HttpResponse, ApiError> {
    let request = request.into_inner();
    if request.query.trim().is_empty() {
        return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
    }

    let response = agent
        .handle(request.session_id.as_deref(), &request.query)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn assistant(
    request: Json<AssistantRequest>,
    router: web::Data<AssistantRouter>,
) -> Result<HttpResponse, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
    }

    let response = router.handle(&request.query).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        catalog_repository::test_support::{summary, InMemoryCatalog},
        llm::test_support::ScriptedChat,
        session_store::test_support::memory_store,
        ChatOptions,
    };
    use actix_web::{http::StatusCode, test, App};
    use std::{sync::Arc, time::Duration};

    fn filter_service(replies: &[&str]) -> FilterChatService {
        FilterChatService::new(
            Arc::new(InMemoryCatalog::new(vec![summary(1, "Wool Hat", "Hats", 25.0)])),
            Arc::new(ScriptedChat::new(replies)),
            Arc::new(memory_store(Duration::from_secs(60))),
            ChatOptions {
                temperature: 0.0,
                max_tokens: 100,
            },
        )
    }

    #[actix_web::test]
    async fn test_empty_message_is_bad_request() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(filter_service(&[])))
                .service(web::scope("/api").configure(chat_config)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/filters/chat")
            .set_json(json!({"message": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_filter_turn_and_reset() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(filter_service(&[r#"{"product_type": "hats", "price": 30}"#])))
                .service(web::scope("/api").configure(chat_config)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/filters/chat")
            .set_json(json!({"session_id": "web-1", "message": "a hat for 30 dollars"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session_id"], "web-1");
        assert_eq!(body["complete"], true);
        assert_eq!(body["products"][0]["title"], "Wool Hat");

        let req = test::TestRequest::delete()
            .uri("/api/v1/filters/web-1")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cleared"], true);
    }
}
