use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::auth::TokenProvider;
use crate::capabilities::{HostPolicy, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ValidatedUrl};
use crate::compression::{CompressionSettings, DEFAULT_COMPRESSION_RATIO};
use crate::config::ClientConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{FileItem, FolderId, FolderItem, Item, ItemId, ItemKind, ItemRef, UnixTimeMs};

/// Metadata registration request for an object that already sits in the
/// object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterObject {
    pub name: String,
    pub url: String,
    pub parent_id: Option<FolderId>,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionReceipt {
    /// Percentage of the original size saved.
    pub compression_ratio: f64,
    /// The new file, when the backend describes it.
    pub item: Option<FileItem>,
}

/// One call per backend verb. Every call needs a signed-in user; none of them
/// retry.
#[async_trait::async_trait]
pub trait MetadataApi: Send + Sync {
    async fn list_files(&self, folder: Option<&FolderId>) -> CoreResult<Vec<FileItem>>;
    async fn list_folders(&self, parent: Option<&FolderId>) -> CoreResult<Vec<FolderItem>>;
    async fn search(&self, query: &str) -> CoreResult<Vec<FileItem>>;
    async fn create_folder(&self, name: &str, parent: Option<&FolderId>) -> CoreResult<FolderItem>;
    /// Returns the server's copy of the renamed item when it sends one.
    async fn rename(&self, item: &ItemRef, new_name: &str) -> CoreResult<Option<Item>>;
    async fn delete(&self, item: &ItemRef) -> CoreResult<()>;
    /// Flips the favourite flag server-side. Returns the updated file when
    /// the server sends one.
    async fn toggle_favorite(&self, id: &ItemId) -> CoreResult<Option<FileItem>>;
    async fn compress(
        &self,
        id: &ItemId,
        settings: &CompressionSettings,
    ) -> CoreResult<CompressionReceipt>;
    async fn register(&self, object: &RegisterObject) -> CoreResult<FileItem>;
    async fn download_url(&self, id: &ItemId) -> CoreResult<String>;
}

// ============================================================================
// Wire format
// ============================================================================

/// Timestamps arrive as epoch millis, RFC 3339, or a zone-less
/// `LocalDateTime` string which is read as UTC.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTime {
    Millis(u64),
    Text(String),
}

impl WireTime {
    fn to_unix_ms(&self) -> Option<UnixTimeMs> {
        match self {
            WireTime::Millis(ms) => Some(UnixTimeMs(*ms)),
            WireTime::Text(text) => {
                let millis = DateTime::parse_from_rfc3339(text)
                    .map(|dt| dt.timestamp_millis())
                    .or_else(|_| {
                        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                            .map(|dt| dt.and_utc().timestamp_millis())
                    })
                    .ok()?;
                u64::try_from(millis).ok().map(UnixTimeMs)
            }
        }
    }
}

fn first_time(candidates: [&Option<WireTime>; 3]) -> Option<UnixTimeMs> {
    candidates
        .into_iter()
        .flatten()
        .find_map(WireTime::to_unix_ms)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDto {
    id: ItemId,
    name: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "type", alias = "mimeType")]
    mime_type: Option<String>,
    #[serde(default, alias = "favorites")]
    favourite: Option<bool>,
    #[serde(default)]
    folder_id: Option<ItemId>,
    #[serde(default)]
    modified_at: Option<WireTime>,
    #[serde(default)]
    updated_at: Option<WireTime>,
    #[serde(default)]
    created_at: Option<WireTime>,
}

impl From<FileDto> for FileItem {
    fn from(dto: FileDto) -> Self {
        let modified_at = first_time([&dto.modified_at, &dto.updated_at, &dto.created_at]);
        FileItem {
            id: dto.id,
            name: dto.name,
            parent_id: dto.folder_id,
            modified_at,
            url: dto.url.unwrap_or_default(),
            size_bytes: dto.size,
            mime_type: dto.mime_type.filter(|m| !m.trim().is_empty()),
            favorite: dto.favourite.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderDto {
    id: ItemId,
    name: String,
    #[serde(default, alias = "parentFolderId")]
    parent_id: Option<ItemId>,
    #[serde(default)]
    modified_at: Option<WireTime>,
    #[serde(default)]
    updated_at: Option<WireTime>,
    #[serde(default)]
    created_at: Option<WireTime>,
}

impl From<FolderDto> for FolderItem {
    fn from(dto: FolderDto) -> Self {
        let modified_at = first_time([&dto.modified_at, &dto.updated_at, &dto.created_at]);
        FolderItem {
            id: dto.id,
            name: dto.name,
            parent_id: dto.parent_id,
            modified_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompressionDto {
    #[serde(default)]
    compression_ratio: Option<f64>,
    #[serde(default)]
    id: Option<ItemId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    compressed_size: Option<u64>,
    #[serde(default)]
    folder_id: Option<ItemId>,
    #[serde(default)]
    favourite: Option<bool>,
    #[serde(default)]
    updated_at: Option<WireTime>,
    #[serde(default)]
    created_at: Option<WireTime>,
}

impl From<CompressionDto> for CompressionReceipt {
    fn from(dto: CompressionDto) -> Self {
        let modified_at = first_time([&None, &dto.updated_at, &dto.created_at]);
        let item = match (dto.id, dto.name) {
            (Some(id), Some(name)) => Some(FileItem {
                id,
                name,
                parent_id: dto.folder_id,
                modified_at,
                url: dto.url.unwrap_or_default(),
                size_bytes: dto.compressed_size,
                mime_type: None,
                favorite: dto.favourite.unwrap_or(false),
            }),
            _ => None,
        };
        CompressionReceipt {
            compression_ratio: dto
                .compression_ratio
                .filter(|r| r.is_finite())
                .unwrap_or(DEFAULT_COMPRESSION_RATIO),
            item,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderBody<'a> {
    name: &'a str,
    parent_id: Option<&'a FolderId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody<'a> {
    new_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    name: &'a str,
    url: &'a str,
    folder_id: Option<&'a FolderId>,
    #[serde(rename = "type")]
    mime_type: &'a str,
    size: u64,
}

#[derive(Deserialize)]
struct DownloadUrlDto {
    #[serde(alias = "downloadUrl")]
    url: String,
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpMetadataClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenProvider>,
    base_url: ValidatedUrl,
    host_policy: HostPolicy,
    timeout_ms: u64,
}

impl HttpMetadataClient {
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> CoreResult<Self> {
        Ok(Self {
            transport,
            tokens,
            base_url: config.api_url()?,
            host_policy: config.host_policy(),
            timeout_ms: config.request_timeout_ms,
        })
    }

    fn collection(kind: ItemKind) -> &'static str {
        match kind {
            ItemKind::File => "files",
            ItemKind::Folder => "folders",
        }
    }

    /// Fails fast without touching the network when signed out.
    async fn send<B: Serialize + Sync>(
        &self,
        method: HttpMethod,
        path: &[&str],
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> CoreResult<HttpResponse> {
        let token = self
            .tokens
            .auth_token()
            .await?
            .ok_or(CoreError::AuthenticationRequired)?;

        let url = self.base_url.join(path, query)?;
        let mut request = HttpRequest::new(method, url)
            .with_timeout_ms(self.timeout_ms)?
            .with_bearer(token.expose())?
            .with_header("Accept", "application/json")?;
        if let Some(body) = body {
            request = request.with_json(body)?;
        }

        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            let error = CoreError::from(HttpError::from_response(&response));
            warn!(status = response.status(), error = %error, "backend rejected request");
            Err(error)
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
    ) -> CoreResult<T> {
        let response = self
            .send::<()>(HttpMethod::Get, path, query, None)
            .await?;
        Ok(response.json()?)
    }
}

fn folder_query<'a>(key: &'static str, folder: Option<&'a FolderId>) -> Vec<(&'static str, &'a str)> {
    folder.map(|id| vec![(key, id.as_str())]).unwrap_or_default()
}

/// Parses an optional echo of the changed item; an empty or unexpected body
/// is not an error.
fn lenient<T: serde::de::DeserializeOwned>(response: &HttpResponse) -> Option<T> {
    if response.body().is_empty() {
        return None;
    }
    response.json().ok()
}

#[async_trait::async_trait]
impl MetadataApi for HttpMetadataClient {
    #[instrument(skip(self), fields(folder = ?folder.map(ItemId::as_str)))]
    async fn list_files(&self, folder: Option<&FolderId>) -> CoreResult<Vec<FileItem>> {
        let files: Vec<FileDto> = self.get(&["files"], &folder_query("folderId", folder)).await?;
        Ok(files.into_iter().map(FileItem::from).collect())
    }

    #[instrument(skip(self), fields(parent = ?parent.map(ItemId::as_str)))]
    async fn list_folders(&self, parent: Option<&FolderId>) -> CoreResult<Vec<FolderItem>> {
        let folders: Vec<FolderDto> = self
            .get(&["folders"], &folder_query("parentId", parent))
            .await?;
        Ok(folders.into_iter().map(FolderItem::from).collect())
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> CoreResult<Vec<FileItem>> {
        let files: Vec<FileDto> = self.get(&["files", "search"], &[("query", query)]).await?;
        Ok(files.into_iter().map(FileItem::from).collect())
    }

    #[instrument(skip(self))]
    async fn create_folder(&self, name: &str, parent: Option<&FolderId>) -> CoreResult<FolderItem> {
        let body = CreateFolderBody {
            name,
            parent_id: parent,
        };
        let response = self
            .send(HttpMethod::Post, &["folders"], &[], Some(&body))
            .await?;
        Ok(response.json::<FolderDto>()?.into())
    }

    #[instrument(skip(self), fields(item_id = %item.id, kind = item.kind.as_str()))]
    async fn rename(&self, item: &ItemRef, new_name: &str) -> CoreResult<Option<Item>> {
        let body = RenameBody { new_name };
        let response = self
            .send(
                HttpMethod::Put,
                &[Self::collection(item.kind), item.id.as_str(), "rename"],
                &[],
                Some(&body),
            )
            .await?;
        Ok(match item.kind {
            ItemKind::File => lenient::<FileDto>(&response).map(|d| Item::File(d.into())),
            ItemKind::Folder => lenient::<FolderDto>(&response).map(|d| Item::Folder(d.into())),
        })
    }

    #[instrument(skip(self), fields(item_id = %item.id, kind = item.kind.as_str()))]
    async fn delete(&self, item: &ItemRef) -> CoreResult<()> {
        self.send::<()>(
            HttpMethod::Delete,
            &[Self::collection(item.kind), item.id.as_str()],
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %id))]
    async fn toggle_favorite(&self, id: &ItemId) -> CoreResult<Option<FileItem>> {
        let response = self
            .send::<()>(HttpMethod::Post, &["files", id.as_str(), "favourite"], &[], None)
            .await?;
        Ok(lenient::<FileDto>(&response).map(FileItem::from))
    }

    #[instrument(skip(self, settings), fields(item_id = %id))]
    async fn compress(
        &self,
        id: &ItemId,
        settings: &CompressionSettings,
    ) -> CoreResult<CompressionReceipt> {
        let response = self
            .send(
                HttpMethod::Post,
                &["files", id.as_str(), "compress"],
                &[],
                Some(settings),
            )
            .await?;
        Ok(response.json::<CompressionDto>()?.into())
    }

    #[instrument(skip(self, object), fields(name = %object.name))]
    async fn register(&self, object: &RegisterObject) -> CoreResult<FileItem> {
        let body = RegisterBody {
            name: &object.name,
            url: &object.url,
            folder_id: object.parent_id.as_ref(),
            mime_type: &object.mime_type,
            size: object.size_bytes,
        };
        let response = self
            .send(HttpMethod::Post, &["files", "register"], &[], Some(&body))
            .await?;
        Ok(response.json::<FileDto>()?.into())
    }

    #[instrument(skip(self), fields(item_id = %id))]
    async fn download_url(&self, id: &ItemId) -> CoreResult<String> {
        let dto: DownloadUrlDto = self.get(&["files", id.as_str(), "download-url"], &[]).await?;
        ValidatedUrl::with_policy(dto.url, self.host_policy)
            .map(|url| url.as_str().to_string())
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::capabilities::HttpHeaders;
    use std::sync::Mutex;

    struct StaticToken(Option<&'static str>);

    #[async_trait::async_trait]
    impl TokenProvider for StaticToken {
        async fn auth_token(&self) -> CoreResult<Option<AuthToken>> {
            Ok(self.0.map(AuthToken::new))
        }
    }

    /// Replays canned responses and records requests.
    struct ScriptedTransport {
        responses: Mutex<Vec<(u16, &'static str)>>,
        seen: Mutex<Vec<(HttpMethod, String, Option<String>)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<(u16, &'static str)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(HttpMethod, String, Option<String>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.seen.lock().unwrap().push((
                request.method(),
                request.url().as_str().to_string(),
                request
                    .body()
                    .map(|b| String::from_utf8_lossy(b).into_owned()),
            ));
            let (status, body) = self.responses.lock().unwrap().remove(0);
            Ok(HttpResponse::new(
                status,
                HttpHeaders::new(),
                body.as_bytes().to_vec(),
                request.request_id().to_string(),
            ))
        }
    }

    fn client(transport: Arc<ScriptedTransport>, token: Option<&'static str>) -> HttpMetadataClient {
        let config = ClientConfig {
            api_base_url: "https://api.example.com/api".into(),
            ..Default::default()
        };
        HttpMetadataClient::new(&config, transport, Arc::new(StaticToken(token))).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_fails_fast() {
        let transport = ScriptedTransport::new(vec![]);
        let api = client(Arc::clone(&transport), None);
        let err = api.list_files(None).await.unwrap_err();
        assert!(matches!(err, CoreError::AuthenticationRequired));
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_list_files_parses_backend_shapes() {
        let transport = ScriptedTransport::new(vec![(
            200,
            r#"[
                {"id": 1, "name": "a.png", "url": "https://cdn.example.com/a.png", "size": 100,
                 "type": "image/png", "favourite": true, "folderId": 9,
                 "updatedAt": "2024-03-01T10:00:00.000"},
                {"id": "2", "name": "b.txt", "favorites": false, "createdAt": 1700000000000}
            ]"#,
        )]);
        let api = client(Arc::clone(&transport), Some("tok"));
        let folder = ItemId::from(9);
        let files = api.list_files(Some(&folder)).await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, ItemId::from(1));
        assert!(files[0].favorite);
        assert_eq!(files[0].size_bytes, Some(100));
        assert_eq!(files[0].parent_id, Some(folder));
        assert_eq!(files[0].modified_at, Some(UnixTimeMs(1_709_287_200_000)));
        assert_eq!(files[1].modified_at, Some(UnixTimeMs(1_700_000_000_000)));
        assert_eq!(files[1].size_bytes, None);

        let seen = transport.seen();
        assert_eq!(seen[0].1, "https://api.example.com/api/files?folderId=9");
    }

    #[tokio::test]
    async fn test_rename_routes_by_kind() {
        let transport = ScriptedTransport::new(vec![(200, ""), (200, r#"{"id":3,"name":"New"}"#)]);
        let api = client(Arc::clone(&transport), Some("tok"));

        let file = ItemRef {
            id: ItemId::from(1),
            kind: ItemKind::File,
        };
        assert_eq!(api.rename(&file, "b.txt").await.unwrap(), None);

        let folder = ItemRef {
            id: ItemId::from(3),
            kind: ItemKind::Folder,
        };
        let echoed = api.rename(&folder, "New").await.unwrap().unwrap();
        assert_eq!(echoed.name(), "New");

        let seen = transport.seen();
        assert_eq!(seen[0].0, HttpMethod::Put);
        assert_eq!(seen[0].1, "https://api.example.com/api/files/1/rename");
        assert_eq!(seen[0].2.as_deref(), Some(r#"{"newName":"b.txt"}"#));
        assert_eq!(seen[1].1, "https://api.example.com/api/folders/3/rename");
    }

    #[tokio::test]
    async fn test_status_errors_are_classified() {
        let transport = ScriptedTransport::new(vec![
            (401, r#"{"message":"expired"}"#),
            (409, r#"{"error":"Folder already exists"}"#),
        ]);
        let api = client(transport, Some("tok"));

        assert!(matches!(
            api.delete(&ItemRef {
                id: ItemId::from(1),
                kind: ItemKind::File
            })
            .await,
            Err(CoreError::AuthenticationRequired)
        ));

        match api.create_folder("Docs", None).await {
            Err(CoreError::RemoteRejected { status, message }) => {
                assert_eq!(status, Some(409));
                assert_eq!(message, "Folder already exists");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compress_receipt_defaults_ratio() {
        let transport = ScriptedTransport::new(vec![
            (200, r#"{"id": 7, "name": "a_compressed.zip", "compressedSize": 10, "compressionRatio": 42.5}"#),
            (200, r#"{}"#),
        ]);
        let api = client(Arc::clone(&transport), Some("tok"));
        let settings = CompressionSettings::Archive {
            format: crate::compression::ArchiveFormat::Zip,
            level: crate::compression::CompressionLevel::Fast,
        };

        let receipt = api.compress(&ItemId::from(1), &settings).await.unwrap();
        assert_eq!(receipt.compression_ratio, 42.5);
        let item = receipt.item.unwrap();
        assert_eq!(item.name, "a_compressed.zip");
        assert_eq!(item.size_bytes, Some(10));

        let bare = api.compress(&ItemId::from(1), &settings).await.unwrap();
        assert_eq!(bare.compression_ratio, DEFAULT_COMPRESSION_RATIO);
        assert!(bare.item.is_none());

        assert_eq!(
            transport.seen()[0].2.as_deref(),
            Some(r#"{"type":"archive","format":"zip","level":"fast"}"#)
        );
    }

    #[tokio::test]
    async fn test_register_body() {
        let transport = ScriptedTransport::new(vec![(
            200,
            r#"{"id": 11, "name": "p.jpg", "url": "https://cdn.example.com/p.jpg", "size": 5}"#,
        )]);
        let api = client(Arc::clone(&transport), Some("tok"));
        let item = api
            .register(&RegisterObject {
                name: "p.jpg".into(),
                url: "https://cdn.example.com/p.jpg".into(),
                parent_id: None,
                mime_type: "image/jpeg".into(),
                size_bytes: 5,
            })
            .await
            .unwrap();
        assert_eq!(item.id, ItemId::from(11));

        let body: serde_json::Value =
            serde_json::from_str(transport.seen()[0].2.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "name": "p.jpg",
                "url": "https://cdn.example.com/p.jpg",
                "folderId": null,
                "type": "image/jpeg",
                "size": 5
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_transport_error() {
        let transport = ScriptedTransport::new(vec![(200, "<html>")]);
        let api = client(transport, Some("tok"));
        let err = api.search("x").await.unwrap_err();
        assert!(matches!(err, CoreError::Transport { .. }));
    }
}
