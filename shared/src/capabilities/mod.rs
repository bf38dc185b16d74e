//! Platform-facing ports: HTTP transport and key/value persistence.
//!
//! The core talks to these through traits so shells can swap in their own
//! implementations; the crate ships `reqwest` and SQLite defaults.

mod http;
mod kv;

pub use self::http::{
    HostPolicy, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, KvValue, MemoryKvStore, StorageErrorCode,
    TypedKvStore,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;

