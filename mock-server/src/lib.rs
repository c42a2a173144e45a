use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Widget {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub size: u32,
}

#[derive(Deserialize)]
pub struct CreateWidget {
    pub name: String,
    #[serde(default)]
    pub size: u32,
}

/// What the server saw of a request sent to `/echo`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    pub query: Option<String>,
    pub headers: Map<String, Value>,
    pub body: String,
}

/// Answer of `/upload`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub received: usize,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

pub type Db = Arc<RwLock<HashMap<Uuid, Widget>>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(HashMap::new()));
    Router::new()
        .route("/widgets", get(list_widgets).post(create_widget))
        .route("/widgets/{id}", get(get_widget).delete(delete_widget))
        .route("/echo", any(echo))
        .route("/upload", post(upload))
        .route("/files/{name}", get(file))
        .route("/text", get(text))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Deterministic body served for `/files/{name}`.
pub fn file_contents(name: &str) -> Vec<u8> {
    format!("contents of {name}\n").repeat(64).into_bytes()
}

async fn list_widgets(State(db): State<Db>) -> Json<Vec<Widget>> {
    let widgets = db.read().await;
    let mut list: Vec<Widget> = widgets.values().cloned().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    Json(list)
}

async fn create_widget(
    State(db): State<Db>,
    Json(input): Json<CreateWidget>,
) -> (StatusCode, Json<Widget>) {
    let widget = Widget {
        id: Uuid::new_v4(),
        name: input.name,
        size: input.size,
    };
    tracing::debug!(id = %widget.id, "widget created");
    db.write().await.insert(widget.id, widget.clone());
    (StatusCode::CREATED, Json(widget))
}

async fn get_widget(State(db): State<Db>, Path(id): Path<Uuid>) -> Result<Json<Widget>, (StatusCode, Json<Value>)> {
    let widgets = db.read().await;
    widgets.get(&id).cloned().map(Json).ok_or_else(not_found)
}

async fn delete_widget(State(db): State<Db>, Path(id): Path<Uuid>) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let mut widgets = db.write().await;
    widgets
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(not_found)
}

fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "widget not found"})))
}

async fn echo(method: Method, RawQuery(query): RawQuery, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            (name.as_str().to_string(), Value::String(value))
        })
        .collect();
    Json(Echo {
        method: method.to_string(),
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn upload(headers: HeaderMap, body: Bytes) -> Json<UploadReceipt> {
    let text = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    tracing::debug!(len = body.len(), "upload received");
    Json(UploadReceipt {
        received: body.len(),
        content_type: text(header::CONTENT_TYPE),
        content_length: text(header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
    })
}

async fn file(Path(name): Path<String>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/octet-stream")], file_contents(&name))
}

async fn text() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "plain hello")
}
