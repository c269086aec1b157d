use super::*;
use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use shared::{domain::MessageKind, error::ErrorKind};
use tokio::{net::TcpListener, sync::Mutex};

use crate::credentials::{NoCredentials, SharedToken, StaticToken};

#[derive(Clone, Default)]
struct Recorded {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
    posts: Arc<Mutex<Vec<Value>>>,
}

impl Recorded {
    async fn record(&self, query: HashMap<String, String>, headers: &HeaderMap) {
        self.queries.lock().await.push(query);
        let auth = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.auth.lock().await.push(auth);
    }
}

async fn list_users(
    State(state): State<Recorded>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    state.record(query.clone(), &headers).await;
    if query.get("search").map(String::as_str) == Some("boom") {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(json!({
        "data": [{"id": 1, "name": "ada"}, {"id": 2, "name": "alan"}],
        "total": 2
    })))
}

async fn list_messages(
    State(state): State<Recorded>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    state.record(query, &headers).await;
    Json(json!({
        "messages": [
            {"id": "m2", "content": "second", "senderId": "u2", "timestamp": "2024-05-01T12:01:00Z"},
            {"id": "m1", "content": "first", "senderId": "u1", "timestamp": "2024-05-01T12:00:00Z"}
        ],
        "hasMore": true
    }))
}

async fn post_message(
    State(state): State<Recorded>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.posts.lock().await.push(body.clone());
    if body["content"] == "reject" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "content not allowed"})),
        );
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "message": {
                "id": "srv-1",
                "content": body["content"],
                "senderId": "u1",
                "timestamp": "2024-05-01T12:02:00Z",
                "status": "delivered",
                "type": body["type"]
            }
        })),
    )
}

async fn spawn_api_server() -> (String, Recorded) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Recorded::default();
    let app = Router::new()
        .route("/users", get(list_users))
        .route("/messages", get(list_messages).post(post_message))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[tokio::test]
async fn collection_endpoint_sends_params_and_fresh_credentials() {
    let (base, recorded) = spawn_api_server().await;
    let token = Arc::new(SharedToken::new(Some("first".into())));
    let url = Url::parse(&format!("{base}/users")).expect("url");
    let endpoint = HttpCollectionEndpoint::new(url, token.clone())
        .with_headers(vec![("x-tenant".into(), "acme".into())]);

    let response: CollectionResponse<Value> = endpoint
        .fetch(&params(&[("search", "a"), ("limit", "10"), ("skip", "0")]))
        .await
        .expect("fetch");
    assert_eq!(response.items.len(), 2);
    assert_eq!(response.total, Some(2));
    assert_eq!(response.has_more, None);

    token.set("second").await;
    let _: CollectionResponse<Value> = endpoint.fetch(&[]).await.expect("fetch");

    let queries = recorded.queries.lock().await.clone();
    assert_eq!(queries[0].get("search").map(String::as_str), Some("a"));
    assert_eq!(queries[0].get("skip").map(String::as_str), Some("0"));
    assert!(queries[1].is_empty());
    assert_eq!(
        recorded.auth.lock().await.clone(),
        vec![Some("Bearer first".into()), Some("Bearer second".into())]
    );
}

#[tokio::test]
async fn collection_endpoint_maps_server_errors() {
    let (base, _) = spawn_api_server().await;
    let url = Url::parse(&format!("{base}/users")).expect("url");
    let endpoint = HttpCollectionEndpoint::new(url, Arc::new(NoCredentials));

    let err = CollectionEndpoint::<Value>::fetch(&endpoint, &params(&[("search", "boom")]))
        .await
        .expect_err("500");
    assert!(matches!(err, SyncError::Status { status: 500 }));
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);

    let missing = HttpCollectionEndpoint::new(
        Url::parse(&format!("{base}/nope")).expect("url"),
        Arc::new(NoCredentials),
    );
    let err = CollectionEndpoint::<Value>::fetch(&missing, &[])
        .await
        .expect_err("404");
    assert_eq!(err.kind(), ErrorKind::ValidationRejection);
}

#[tokio::test]
async fn message_api_reads_history_with_cursor() {
    let (base, recorded) = spawn_api_server().await;
    let api = HttpMessageApi::new(format!("{base}/"), Arc::new(NoCredentials));

    let page = api.history(20, Some("m9")).await.expect("history");
    assert!(page.has_more);
    assert_eq!(page.messages[0].id, "m2");

    let query = recorded.queries.lock().await[0].clone();
    assert_eq!(query.get("limit").map(String::as_str), Some("20"));
    assert_eq!(query.get("before").map(String::as_str), Some("m9"));
    assert_eq!(recorded.auth.lock().await[0], None);
}

#[tokio::test]
async fn message_api_posts_and_surfaces_rejections() {
    let (base, recorded) = spawn_api_server().await;
    let api = HttpMessageApi::new(base, Arc::new(StaticToken("t0k".into())));

    let sent = api
        .send(&SendMessageRequest {
            content: "hi".into(),
            kind: MessageKind::Text,
            metadata: None,
        })
        .await
        .expect("send");
    assert_eq!(sent.id, "srv-1");
    assert_eq!(sent.status, shared::domain::MessageStatus::Delivered);
    assert_eq!(recorded.posts.lock().await[0], json!({"content": "hi", "type": "text"}));

    let err = api
        .send(&SendMessageRequest {
            content: "reject".into(),
            kind: MessageKind::Text,
            metadata: None,
        })
        .await
        .expect_err("rejected");
    match err {
        SyncError::Rejected { status, message } => {
            assert_eq!(status, 422);
            assert!(message.contains("content not allowed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
