mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::{orchestrator, FakeServices};
use enhaia::credentials::ApiKeySlot;
use enhaia::web_server::{build_router, WebConfig};
use serde_json::{json, Value};

fn web_config() -> WebConfig {
    WebConfig {
        templates_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/templates").to_string(),
        static_dir: concat!(env!("CARGO_MANIFEST_DIR"), "/static").to_string(),
    }
}

async fn server_with(services: Arc<FakeServices>, api_key: ApiKeySlot) -> TestServer {
    let orchestrator = orchestrator(services).await;
    TestServer::new(build_router(orchestrator, api_key, &web_config())).unwrap()
}

async fn server() -> TestServer {
    server_with(Arc::new(FakeServices::default()), ApiKeySlot::default()).await
}

async fn state(server: &TestServer) -> Value {
    server.get("/api/state").await.json::<Value>()
}

async fn active_chat_id(server: &TestServer) -> String {
    state(server).await["activeChatId"].as_str().unwrap().to_string()
}

/// Polls until the message is no longer loading.
async fn wait_for_message(server: &TestServer, chat_id: &str, message_id: u64) -> Value {
    for _ in 0..200 {
        let state = state(server).await;
        let message = state["chats"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == chat_id)
            .and_then(|c| {
                c["messages"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .find(|m| m["id"] == message_id)
                    .cloned()
            });
        if let Some(message) = message {
            if message.get("isLoading").is_none() {
                return message;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("message {message_id} never resolved");
}

#[test_log::test(tokio::test)]
async fn test_index_renders_active_chat() {
    let server = server().await;
    let response = server.get("/").await;
    response.assert_status_ok();
    let html = response.text();
    assert!(html.contains("enhaIA"));
    assert!(html.contains("Nova Conversa"));
}

#[tokio::test]
async fn test_static_files_are_served() {
    let server = server().await;
    server.get("/static/app.js").await.assert_status_ok();
    server.get("/static/missing.js").await.assert_status_not_found();
}

#[tokio::test]
async fn test_initial_state_has_one_seeded_chat() {
    let server = server().await;
    let state = state(&server).await;
    let chats = state["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["title"], "Nova Conversa");
    assert_eq!(chats[0]["messages"][0]["role"], "assistant");
    assert_eq!(state["activeChatId"], chats[0]["id"]);
}

#[tokio::test]
async fn test_chat_lifecycle() {
    let server = server().await;
    let first = active_chat_id(&server).await;

    let response = server.post("/api/chats").await;
    response.assert_status(StatusCode::CREATED);
    let second = response.json::<Value>()["id"].as_str().unwrap().to_string();
    assert_eq!(active_chat_id(&server).await, second);

    server
        .patch(&format!("/api/chats/{second}"))
        .json(&json!({ "title": "Viagens" }))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .post(&format!("/api/chats/{first}/select"))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let state = state(&server).await;
    assert_eq!(state["activeChatId"], first.as_str());
    assert_eq!(state["chats"][0]["title"], "Viagens");

    server
        .delete(&format!("/api/chats/{first}"))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    assert_eq!(active_chat_id(&server).await, second);

    server
        .delete(&format!("/api/chats/{first}"))
        .await
        .assert_status_not_found();
    server
        .post("/api/chats/unknown/select")
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn test_send_message_runs_turn() {
    let services = Arc::new(FakeServices::default());
    let server = server_with(services.clone(), ApiKeySlot::default()).await;
    let chat_id = active_chat_id(&server).await;

    let response = server
        .post(&format!("/api/chats/{chat_id}/messages"))
        .json(&json!({ "text": "Olá" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let accepted = response.json::<Value>();
    assert_eq!(accepted["chatId"], chat_id.as_str());
    let message_id = accepted["messageId"].as_u64().unwrap();

    let message = wait_for_message(&server, &chat_id, message_id).await;
    assert_eq!(message["content"], "Resposta para Olá");
    assert_eq!(services.count("reply:Olá"), 1);

    let hits = server
        .get(&format!("/api/chats/{chat_id}/messages"))
        .add_query_param("q", "resposta")
        .await
        .json::<Value>();
    assert_eq!(hits.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_send_message_with_image_upload() {
    let services = Arc::new(FakeServices::default());
    let server = server_with(services.clone(), ApiKeySlot::default()).await;
    let chat_id = active_chat_id(&server).await;

    let response = server
        .post(&format!("/api/chats/{chat_id}/messages"))
        .json(&json!({
            "text": "o que é isto?",
            "image": { "mimeType": "image/png", "data": "AQID" }
        }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let message_id = response.json::<Value>()["messageId"].as_u64().unwrap();
    wait_for_message(&server, &chat_id, message_id).await;

    assert_eq!(services.count("reply:o que é isto?:true"), 1);
    let state = state(&server).await;
    assert_eq!(
        state["chats"][0]["messages"][1]["userImageUrl"],
        "data:image/png;base64,AQID"
    );
}

#[tokio::test]
async fn test_send_message_rejections() {
    let server = server().await;
    let chat_id = active_chat_id(&server).await;
    let path = format!("/api/chats/{chat_id}/messages");

    server
        .post(&path)
        .json(&json!({ "text": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post(&path)
        .json(&json!({ "text": "x", "image": { "mimeType": "image/png", "data": "%%%" } }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/api/chats/unknown/messages")
        .json(&json!({ "text": "Olá" }))
        .await
        .assert_status_not_found();

    // Nothing was appended.
    let state = state(&server).await;
    assert_eq!(state["chats"][0]["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_api_key_endpoints() {
    let api_key = ApiKeySlot::default();
    let server = server_with(Arc::new(FakeServices::default()), api_key.clone()).await;

    let status = server.get("/api/key").await.json::<Value>();
    assert_eq!(status["selected"], false);

    server
        .post("/api/key")
        .json(&json!({ "apiKey": "  " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/api/key")
        .json(&json!({ "apiKey": "AIza-test" }))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let status = server.get("/api/key").await.json::<Value>();
    assert_eq!(status["selected"], true);
    assert_eq!(api_key.get().await.as_deref(), Some("AIza-test"));
}
