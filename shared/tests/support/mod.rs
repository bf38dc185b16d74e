use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cloudstore_core::capabilities::{
    HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpTransport, KeyValueStore, SqliteKvStore,
};
use cloudstore_core::upload::{ObjectStore, ProgressFn, StoredObject, UploadSource};
use cloudstore_core::{
    AuthToken, ClientConfig, CoreContext, CoreResult, FileBrowser, HttpMetadataClient, TokenProvider,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: &'static str,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

/// Answers requests by `"METHOD /path"`. Unrouted requests get a 404.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<HashMap<String, (u16, Value)>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl RoutedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces whatever `route` answered before.
    pub fn route(&self, route: &str, status: u16, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.to_string(), (status, body));
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HttpTransport for RoutedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = url::Url::parse(request.url().as_str()).unwrap();
        let seen = SeenRequest {
            method: request.method().as_str(),
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            authorization: request.headers().get("Authorization").map(str::to_string),
            body: request.body().map(|b| serde_json::from_slice(b).unwrap()),
        };
        let key = format!("{} {}", seen.method, seen.path);
        self.seen.lock().unwrap().push(seen);

        let (status, body) = self
            .routes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| (404, serde_json::json!({ "message": format!("no route for {key}") })));
        let body = if body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&body).unwrap()
        };
        Ok(HttpResponse::new(
            status,
            HttpHeaders::new(),
            body,
            request.request_id().to_string(),
        ))
    }
}

/// Stores every object immediately under a predictable URL.
#[derive(Default)]
pub struct InstantObjectStore {
    puts: AtomicUsize,
}

impl InstantObjectStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObjectStore for InstantObjectStore {
    async fn put_object(
        &self,
        source: &UploadSource,
        on_progress: ProgressFn,
        _cancel: CancellationToken,
    ) -> CoreResult<StoredObject> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let url = format!(
            "https://objects.example.com/raw/{}",
            source.handle.file_name()
        );
        on_progress(100);
        Ok(StoredObject {
            url,
            size_bytes: source.content.len() as u64,
        })
    }
}

pub struct Session {
    pub browser: FileBrowser,
    pub transport: Arc<RoutedTransport>,
    pub objects: Arc<InstantObjectStore>,
    _dir: TempDir,
}

/// A browser over the HTTP client and a SQLite store in a temp dir.
pub async fn session(token: Option<&str>) -> Session {
    let dir = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KeyValueStore> =
        Arc::new(SqliteKvStore::open(dir.path().join("core.db")).unwrap());
    let config = ClientConfig::default();
    let transport = RoutedTransport::new();

    let tokens = Arc::new(cloudstore_core::TokenStore::new(Arc::clone(&kv), &config.token_key).unwrap());
    if let Some(token) = token {
        tokens.save(&AuthToken::new(token)).await.unwrap();
    }
    let api = Arc::new(
        HttpMetadataClient::new(
            &config,
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
            Arc::clone(&tokens) as Arc<dyn TokenProvider>,
        )
        .unwrap(),
    );
    let objects = Arc::new(InstantObjectStore::default());
    let ctx = CoreContext::new(
        config,
        api,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        tokens,
        kv,
    )
    .unwrap();
    Session {
        browser: FileBrowser::new(ctx),
        transport,
        objects,
        _dir: dir,
    }
}
