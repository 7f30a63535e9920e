//! Client-secret and token-file handling.
//!
//! The token file is owned by [`TokenStore`]. Every write after the initial
//! authorization goes through [`TokenStore::apply_patch`], which re-reads the
//! file, overlays the new non-null fields and writes the merged object back.
//! Fields the patch does not mention (including ones this crate does not
//! model) survive a refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use yup_oauth2::storage::{TokenInfo, TokenStorage, TokenStorageError};

use crate::config::Config;
use crate::error::AppError;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth client credentials from the Google Cloud Console download.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The two shapes Google hands out: desktop ("installed") and web apps.
#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn parse(contents: &str) -> Result<Self, AppError> {
        let file: ClientSecretFile = serde_json::from_str(contents)
            .map_err(|e| AppError::Configuration(format!("malformed client secret file: {e}")))?;
        file.installed.or(file.web).ok_or_else(|| {
            AppError::Configuration(
                "client secret file must contain an 'installed' or 'web' key".into(),
            )
        })
    }

    /// Convert into the shape yup-oauth2 expects for its authenticator.
    pub fn to_application_secret(&self, redirect_uri: &str) -> yup_oauth2::ApplicationSecret {
        yup_oauth2::ApplicationSecret {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_uri: self.auth_uri.clone(),
            token_uri: self.token_uri.clone(),
            redirect_uris: vec![redirect_uri.to_string()],
            ..Default::default()
        }
    }
}

/// Read the client secret from the credentials directory.
pub async fn load_client_secret(config: &Config) -> Result<ClientSecret, AppError> {
    let path = config.client_secret_path();
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::Configuration(format!(
                "OAuth keys file not found at {}.\n\
                 Download the OAuth client JSON from Google Cloud Console → APIs & Services → \
                 Credentials, rename it to gcp-oauth.keys.json and place it at that path.",
                path.display()
            )));
        }
        Err(e) => return Err(AppError::Io(e)),
    };
    ClientSecret::parse(&contents)
}

/// Token file contents. `expiry_date` is epoch milliseconds, matching the
/// format written by Google's own client libraries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenSet {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry_date.and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn to_token_info(&self) -> TokenInfo {
        TokenInfo {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expiry_date.and_then(|ms| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
            }),
            id_token: self.id_token.clone(),
        }
    }
}

impl From<TokenInfo> for TokenSet {
    fn from(info: TokenInfo) -> Self {
        let expiry_date = info
            .expires_at
            .and_then(|at| i64::try_from(at.unix_timestamp_nanos() / 1_000_000).ok());
        Self {
            access_token: info.access_token,
            refresh_token: info.refresh_token,
            expiry_date,
            id_token: info.id_token,
            ..Default::default()
        }
    }
}

/// Overlay every non-null field of `patch` onto `current`.
pub fn merge_token_fields(current: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if !value.is_null() {
            current.insert(key, value);
        }
    }
}

/// Backend holding the raw token file bytes.
#[async_trait]
pub trait TokenFile: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    async fn read(&self) -> std::io::Result<Option<String>>;

    async fn write(&self, contents: &str) -> std::io::Result<()>;

    /// Human-readable location, used in error messages.
    fn location(&self) -> String;
}

/// Token file on the local filesystem.
#[derive(Debug, Clone)]
pub struct DiskTokenFile {
    path: PathBuf,
}

impl DiskTokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenFile for DiskTokenFile {
    async fn read(&self) -> std::io::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // Owner-only: the file holds a long-lived refresh token
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Single owner of the token file.
#[derive(Clone)]
pub struct TokenStore {
    file: Arc<dyn TokenFile>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("location", &self.file.location())
            .finish()
    }
}

impl TokenStore {
    pub fn new(file: impl TokenFile + 'static) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    pub fn on_disk(config: &Config) -> Self {
        Self::new(DiskTokenFile::new(config.token_path()))
    }

    pub fn location(&self) -> String {
        self.file.location()
    }

    /// Load the current token set. A missing file means `auth` has never run.
    pub async fn load(&self) -> Result<TokenSet, AppError> {
        let contents = self
            .file
            .read()
            .await?
            .ok_or_else(|| AppError::NotAuthenticated(self.location()))?;
        serde_json::from_str(&contents).map_err(|e| {
            AppError::Configuration(format!("malformed token file {}: {e}", self.location()))
        })
    }

    /// Overwrite the token file. Only the authorization flow does this.
    pub async fn replace(&self, tokens: &TokenSet) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(tokens)?;
        self.file.write(&json).await?;
        Ok(())
    }

    /// Read the current file, merge `patch` over it and write the result.
    ///
    /// A missing file is treated as empty. There is no file lock; concurrent
    /// refreshes in separate processes may race.
    pub async fn apply_patch(&self, patch: &TokenSet) -> Result<TokenSet, AppError> {
        let mut current = match self.file.read().await? {
            Some(contents) => serde_json::from_str::<Map<String, Value>>(&contents).map_err(|e| {
                AppError::Configuration(format!("malformed token file {}: {e}", self.location()))
            })?,
            None => Map::new(),
        };

        let patch = match serde_json::to_value(patch)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merge_token_fields(&mut current, patch);

        let json = serde_json::to_string_pretty(&current)?;
        self.file.write(&json).await?;
        Ok(serde_json::from_value(Value::Object(current))?)
    }
}

/// Token storage for the yup-oauth2 authenticator. Reads come from the token
/// file; writes (which happen whenever the authenticator refreshes the access
/// token) are merged into it.
#[async_trait]
impl TokenStorage for TokenStore {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<(), TokenStorageError> {
        let merged = self
            .apply_patch(&TokenSet::from(token))
            .await
            .inspect_err(|e| tracing::error!("failed to persist refreshed tokens: {e}"))
            .map_err(|e| match e {
                AppError::Io(e) => TokenStorageError::Io(e),
                other => TokenStorageError::Other(other.to_string().into()),
            })?;
        tracing::info!("Tokens refreshed and saved to {}", self.location());
        tracing::debug!("Token expires: {:?}", merged.expires_at());
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        match self.load().await {
            Ok(tokens) => Some(tokens.to_token_info()),
            Err(e) => {
                tracing::warn!("token file unavailable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::config::DRIVE_SCOPE;

    /// In-memory token file that counts writes.
    #[derive(Default)]
    pub(crate) struct MemoryTokenFile {
        pub contents: Mutex<Option<String>>,
        pub writes: Mutex<usize>,
    }

    impl MemoryTokenFile {
        pub fn with(value: Value) -> Self {
            Self {
                contents: Mutex::new(Some(value.to_string())),
                writes: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenFile for Arc<MemoryTokenFile> {
        async fn read(&self) -> std::io::Result<Option<String>> {
            Ok(self.contents.lock().unwrap().clone())
        }

        async fn write(&self, contents: &str) -> std::io::Result<()> {
            *self.contents.lock().unwrap() = Some(contents.to_string());
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        fn location(&self) -> String {
            "memory".into()
        }
    }

    fn stored(file: &MemoryTokenFile) -> Value {
        let contents = file.contents.lock().unwrap().clone().unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    #[test]
    fn parse_installed_secret() {
        let secret = ClientSecret::parse(
            r#"{"installed":{"client_id":"id","client_secret":"shh","token_uri":"https://t"}}"#,
        )
        .unwrap();
        assert_eq!(secret.client_id, "id");
        assert_eq!(secret.client_secret, "shh");
        assert_eq!(secret.token_uri, "https://t");
        assert_eq!(secret.auth_uri, DEFAULT_AUTH_URI);
    }

    #[test]
    fn parse_web_secret() {
        let secret =
            ClientSecret::parse(r#"{"web":{"client_id":"w","client_secret":"s"}}"#).unwrap();
        assert_eq!(secret.client_id, "w");
        assert_eq!(secret.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn parse_secret_without_known_shape() {
        let err = ClientSecret::parse(r#"{"other":{}}"#).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
        let err = ClientSecret::parse("not json").unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_secret_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_dir(Some(dir.path().to_path_buf())).unwrap();
        let err = load_client_secret(&config).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn load_without_token_file_requires_auth() {
        let file = Arc::new(MemoryTokenFile::default());
        let store = TokenStore::new(file);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, AppError::NotAuthenticated(_)));
    }

    #[tokio::test]
    async fn patch_keeps_fields_it_does_not_mention() {
        let file = Arc::new(MemoryTokenFile::with(json!({
            "access_token": "old-access",
            "refresh_token": "refresh-1",
            "expiry_date": 1_000,
            "scope": "https://www.googleapis.com/auth/drive",
            "token_type": "Bearer",
            "custom": {"kept": true},
        })));
        let store = TokenStore::new(file.clone());

        let patch = TokenSet {
            access_token: Some("new-access".into()),
            expiry_date: Some(2_000),
            ..Default::default()
        };
        let merged = store.apply_patch(&patch).await.unwrap();

        assert_eq!(merged.access_token.as_deref(), Some("new-access"));
        assert_eq!(merged.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(
            stored(&file),
            json!({
                "access_token": "new-access",
                "refresh_token": "refresh-1",
                "expiry_date": 2_000,
                "scope": "https://www.googleapis.com/auth/drive",
                "token_type": "Bearer",
                "custom": {"kept": true},
            })
        );
        assert_eq!(*file.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn patch_rereads_file_changed_externally() {
        let file = Arc::new(MemoryTokenFile::with(json!({"access_token": "a"})));
        let store = TokenStore::new(file.clone());

        // Someone else edits the file between load and refresh
        *file.contents.lock().unwrap() =
            Some(json!({"access_token": "a", "refresh_token": "r2"}).to_string());

        store
            .apply_patch(&TokenSet {
                access_token: Some("b".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored(&file), json!({"access_token": "b", "refresh_token": "r2"}));
    }

    #[test]
    fn merge_skips_null_values() {
        let mut current = json!({"refresh_token": "keep"}).as_object().unwrap().clone();
        let patch = json!({"refresh_token": null, "access_token": "x"})
            .as_object()
            .unwrap()
            .clone();
        merge_token_fields(&mut current, patch);
        assert_eq!(
            Value::Object(current),
            json!({"refresh_token": "keep", "access_token": "x"})
        );
    }

    #[tokio::test]
    async fn storage_set_merges_refreshed_token() {
        let file = Arc::new(MemoryTokenFile::with(json!({
            "access_token": "old",
            "refresh_token": "long-lived",
            "scope": "drive",
        })));
        let store = TokenStore::new(file.clone());

        let refreshed = TokenInfo {
            access_token: Some("fresh".into()),
            refresh_token: None,
            expires_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).ok(),
            id_token: None,
        };
        TokenStorage::set(&store, &["drive"], refreshed).await.unwrap();

        assert_eq!(
            stored(&file),
            json!({
                "access_token": "fresh",
                "refresh_token": "long-lived",
                "scope": "drive",
                "expiry_date": 1_700_000_000_000_i64,
            })
        );
    }

    #[tokio::test]
    async fn storage_set_through_authenticator_trait_object() {
        let file = Arc::new(MemoryTokenFile::with(json!({"refresh_token": "r"})));
        let storage: Box<dyn TokenStorage> = Box::new(TokenStore::new(file.clone()));

        let refreshed = TokenInfo {
            access_token: Some("fresh".into()),
            refresh_token: None,
            expires_at: None,
            id_token: None,
        };
        storage.set(&[DRIVE_SCOPE], refreshed).await.unwrap();

        assert_eq!(stored(&file), json!({"access_token": "fresh", "refresh_token": "r"}));
    }

    #[tokio::test]
    async fn storage_set_on_malformed_file_is_storage_error() {
        let file = Arc::new(MemoryTokenFile::default());
        *file.contents.lock().unwrap() = Some("{not json".into());
        let store = TokenStore::new(file.clone());

        let err = TokenStorage::set(&store, &[DRIVE_SCOPE], TokenInfo {
            access_token: Some("fresh".into()),
            refresh_token: None,
            expires_at: None,
            id_token: None,
        })
        .await
        .unwrap_err();

        match err {
            TokenStorageError::Other(msg) => assert!(msg.contains("malformed token file")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(file.contents.lock().unwrap().as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn storage_get_converts_expiry() {
        let file = Arc::new(MemoryTokenFile::with(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expiry_date": 1_700_000_000_000_i64,
        })));
        let store = TokenStore::new(file);

        let info = TokenStorage::get(&store, &["drive"]).await.unwrap();
        assert_eq!(info.access_token.as_deref(), Some("a"));
        assert_eq!(info.refresh_token.as_deref(), Some("r"));
        assert_eq!(info.expires_at.unwrap().unix_timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn disk_file_creates_directory_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        let store = TokenStore::new(DiskTokenFile::new(&path));

        let tokens = TokenSet {
            access_token: Some("a".into()),
            refresh_token: Some("r".into()),
            expiry_date: Some(42),
            ..Default::default()
        };
        store.replace(&tokens).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.load().await.unwrap(), tokens);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn malformed_token_file_is_configuration_error() {
        let file = Arc::new(MemoryTokenFile::default());
        *file.contents.lock().unwrap() = Some("{oops".into());
        let store = TokenStore::new(file);
        assert!(matches!(
            store.load().await.unwrap_err(),
            AppError::Configuration(_)
        ));
    }
}
