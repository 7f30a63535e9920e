use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use google_drive3::api::{File, Permission};
use http_body_util::BodyExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::DriveHubType;
use crate::config::DRIVE_SCOPE;
use crate::error::AppError;

pub const GOOGLE_DOC: &str = "application/vnd.google-apps.document";
pub const GOOGLE_SHEET: &str = "application/vnd.google-apps.spreadsheet";
pub const GOOGLE_SLIDE: &str = "application/vnd.google-apps.presentation";
pub const GOOGLE_FOLDER: &str = "application/vnd.google-apps.folder";

pub const FILE_FIELDS: &str = "id, name, mimeType, modifiedTime, size, webViewLink, parents";
const LIST_FIELDS: &str =
    "nextPageToken, files(id, name, mimeType, modifiedTime, size, webViewLink, parents)";
const METADATA_FIELDS: &str = "id, name, mimeType, modifiedTime, createdTime, size, \
                               webViewLink, parents, shared, sharingUser, owners, permissions";

pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_BATCH_READ: usize = 20;

/// Parameters for a single `files.list` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub query: String,
    pub page_size: i32,
    pub order_by: String,
}

/// Upload body plus its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub body: String,
    pub mime_type: String,
}

impl Media {
    /// Zero-length body. `files.create` always takes an upload, so
    /// metadata-only objects such as folders send this.
    pub fn empty() -> Self {
        Self {
            body: String::new(),
            mime_type: mime::APPLICATION_OCTET_STREAM.to_string(),
        }
    }
}

/// A `files.update` call: metadata patch, optional new content, parent edits.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub metadata: File,
    pub media: Option<Media>,
    pub add_parents: Option<String>,
    pub remove_parents: Option<String>,
}

/// The Drive v3 calls the tools need. One method per remote call.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn list_files(&self, request: &ListRequest) -> Result<Vec<File>, AppError>;

    async fn get_file(&self, file_id: &str, fields: &str) -> Result<File, AppError>;

    /// Export a Google Workspace document to the given MIME type.
    async fn export_file(&self, file_id: &str, mime_type: &str) -> Result<String, AppError>;

    /// Download a regular (non-Workspace) file's content.
    async fn download_file(&self, file_id: &str) -> Result<String, AppError>;

    async fn create_file(&self, metadata: File, media: Media) -> Result<File, AppError>;

    async fn update_file(&self, file_id: &str, update: UpdateRequest) -> Result<File, AppError>;

    async fn copy_file(&self, file_id: &str, metadata: File) -> Result<File, AppError>;

    async fn create_permission(
        &self,
        file_id: &str,
        permission: Permission,
        send_notification: bool,
    ) -> Result<Permission, AppError>;
}

/// [`DriveApi`] backed by the google-drive3 hub.
pub struct GoogleDrive {
    hub: DriveHubType,
}

impl std::fmt::Debug for GoogleDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleDrive").finish_non_exhaustive()
    }
}

impl GoogleDrive {
    pub fn new(hub: DriveHubType) -> Self {
        Self { hub }
    }
}

fn drive_error(e: google_drive3::Error) -> AppError {
    AppError::DriveApi(e.to_string())
}

fn parse_mime(mime_type: &str) -> Result<mime::Mime, AppError> {
    mime_type
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("invalid MIME type {mime_type:?}: {e}")))
}

#[async_trait]
impl DriveApi for GoogleDrive {
    async fn list_files(&self, request: &ListRequest) -> Result<Vec<File>, AppError> {
        tracing::info!(
            "listing files: q={:?}, page_size={}",
            request.query,
            request.page_size
        );
        let (_resp, list) = self
            .hub
            .files()
            .list()
            .q(&request.query)
            .page_size(request.page_size)
            .order_by(&request.order_by)
            .param("fields", LIST_FIELDS)
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(drive_error)?;
        Ok(list.files.unwrap_or_default())
    }

    async fn get_file(&self, file_id: &str, fields: &str) -> Result<File, AppError> {
        let (_resp, file) = self
            .hub
            .files()
            .get(file_id)
            .param("fields", fields)
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(drive_error)?;
        Ok(file)
    }

    async fn export_file(&self, file_id: &str, mime_type: &str) -> Result<String, AppError> {
        tracing::info!("exporting {file_id} as {mime_type}");
        let resp = self
            .hub
            .files()
            .export(file_id, mime_type)
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(|e| AppError::DriveApi(format!("export failed for {file_id}: {e}")))?;

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| AppError::DriveApi(format!("failed to read export body: {e}")))?
            .to_bytes();

        String::from_utf8(body.to_vec())
            .map_err(|e| AppError::DriveApi(format!("export produced invalid UTF-8: {e}")))
    }

    async fn download_file(&self, file_id: &str) -> Result<String, AppError> {
        tracing::info!("downloading {file_id} via alt=media");
        let (resp, _file) = self
            .hub
            .files()
            .get(file_id)
            .param("alt", "media")
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(|e| AppError::DriveApi(format!("download failed for {file_id}: {e}")))?;

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| AppError::DriveApi(format!("failed to read download body: {e}")))?
            .to_bytes();

        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn create_file(&self, metadata: File, media: Media) -> Result<File, AppError> {
        let mime_type = parse_mime(&media.mime_type)?;
        let (_resp, file) = self
            .hub
            .files()
            .create(metadata)
            .param("fields", FILE_FIELDS)
            .add_scope(DRIVE_SCOPE)
            .upload(Cursor::new(media.body.into_bytes()), mime_type)
            .await
            .map_err(drive_error)?;
        Ok(file)
    }

    async fn update_file(&self, file_id: &str, update: UpdateRequest) -> Result<File, AppError> {
        let mut call = self
            .hub
            .files()
            .update(update.metadata, file_id)
            .param("fields", FILE_FIELDS)
            .add_scope(DRIVE_SCOPE);
        if let Some(parents) = &update.add_parents {
            call = call.add_parents(parents);
        }
        if let Some(parents) = &update.remove_parents {
            call = call.remove_parents(parents);
        }

        let result = match update.media {
            Some(media) => {
                let mime_type = parse_mime(&media.mime_type)?;
                call.upload(Cursor::new(media.body.into_bytes()), mime_type)
                    .await
            }
            None => call.doit_without_upload().await,
        };
        let (_resp, file) = result.map_err(drive_error)?;
        Ok(file)
    }

    async fn copy_file(&self, file_id: &str, metadata: File) -> Result<File, AppError> {
        let (_resp, file) = self
            .hub
            .files()
            .copy(metadata, file_id)
            .param("fields", FILE_FIELDS)
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(drive_error)?;
        Ok(file)
    }

    async fn create_permission(
        &self,
        file_id: &str,
        permission: Permission,
        send_notification: bool,
    ) -> Result<Permission, AppError> {
        let (_resp, permission) = self
            .hub
            .permissions()
            .create(permission, file_id)
            .send_notification_email(send_notification)
            .add_scope(DRIVE_SCOPE)
            .doit()
            .await
            .map_err(drive_error)?;
        Ok(permission)
    }
}

/// Google-native type to create when converting uploaded content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConvertTo {
    Document,
    Spreadsheet,
    Presentation,
}

impl ConvertTo {
    pub fn native_mime_type(self) -> &'static str {
        match self {
            Self::Document => GOOGLE_DOC,
            Self::Spreadsheet => GOOGLE_SHEET,
            Self::Presentation => GOOGLE_SLIDE,
        }
    }
}

/// Permission role granted by `share`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ShareRole {
    #[default]
    Reader,
    Commenter,
    Writer,
    Organizer,
}

impl ShareRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Commenter => "commenter",
            Self::Writer => "writer",
            Self::Organizer => "organizer",
        }
    }
}

/// Arguments for creating a file with content.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub content: String,
    pub folder_id: Option<String>,
    pub convert_to: Option<ConvertTo>,
    pub mime_type: String,
}

/// Tool-level Drive operations. Each returns the text block handed back to
/// the MCP client.
pub struct DriveClient {
    api: Arc<dyn DriveApi>,
}

impl std::fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient").finish_non_exhaustive()
    }
}

impl DriveClient {
    pub fn new(api: Arc<dyn DriveApi>) -> Self {
        Self { api }
    }

    /// Search with Drive query syntax, newest first.
    pub async fn search(&self, query: &str, page_size: u32) -> Result<String, AppError> {
        let request = ListRequest {
            query: query.to_string(),
            page_size: effective_page_size(page_size),
            order_by: "modifiedTime desc".into(),
        };
        let files = self.api.list_files(&request).await?;
        file_list_text(&files)
    }

    /// List non-trashed children of a folder, folders first.
    pub async fn list(&self, folder_id: &str, page_size: u32) -> Result<String, AppError> {
        let folder_id = parse_file_id(folder_id)?;
        let request = ListRequest {
            query: format!("'{folder_id}' in parents and trashed = false"),
            page_size: effective_page_size(page_size),
            order_by: "folder, name".into(),
        };
        let files = self.api.list_files(&request).await?;
        file_list_text(&files)
    }

    /// Read a file's content. Workspace documents are exported (Docs as
    /// Markdown, Sheets as CSV, Slides as plain text); everything else is
    /// downloaded as-is.
    pub async fn read(&self, file_id_or_url: &str) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let meta = self.api.get_file(&file_id, FILE_FIELDS).await?;

        let mime_type = meta.mime_type.as_deref().unwrap_or_default();
        let name = meta.name.as_deref().unwrap_or("unknown");
        tracing::info!("file metadata: name={name}, mime={mime_type}");

        let content = match export_format(mime_type) {
            Some(export_mime) => self.api.export_file(&file_id, export_mime).await?,
            None => self.api.download_file(&file_id).await?,
        };

        Ok(format!("--- File: {name} ({mime_type}) ---\n\n{content}"))
    }

    /// Read several files concurrently. Sections come back in input order.
    pub async fn read_batch(&self, file_ids: &[String]) -> Result<String, AppError> {
        if file_ids.is_empty() || file_ids.len() > MAX_BATCH_READ {
            return Err(AppError::InvalidInput(format!(
                "file_ids must contain between 1 and {MAX_BATCH_READ} entries, got {}",
                file_ids.len()
            )));
        }

        let reads = file_ids.iter().map(|id| self.read(id));
        let sections = futures::future::join_all(reads)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sections.join("\n\n"))
    }

    pub async fn metadata(&self, file_id_or_url: &str) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let file = self.api.get_file(&file_id, METADATA_FIELDS).await?;
        to_pretty_json(&file)
    }

    /// Create a file from text content. With `convert_to` the declared type
    /// is the Google-native one while the upload keeps `mime_type`.
    pub async fn create_file(&self, new_file: NewFile) -> Result<String, AppError> {
        let folder_id = new_file.folder_id.as_deref().map(parse_file_id).transpose()?;
        let metadata = File {
            name: Some(new_file.name),
            parents: folder_id.map(|id| vec![id]),
            mime_type: new_file
                .convert_to
                .map(|target| target.native_mime_type().to_string()),
            ..Default::default()
        };
        let media = Media {
            body: new_file.content,
            mime_type: new_file.mime_type,
        };

        let file = self.api.create_file(metadata, media).await?;
        Ok(format!("Created file:\n{}", to_pretty_json(&file)?))
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, AppError> {
        let parent_id = parent_id.map(parse_file_id).transpose()?;
        let metadata = File {
            name: Some(name.to_string()),
            mime_type: Some(GOOGLE_FOLDER.to_string()),
            parents: parent_id.map(|id| vec![id]),
            ..Default::default()
        };

        let folder = self.api.create_file(metadata, Media::empty()).await?;
        Ok(format!("Created folder:\n{}", to_pretty_json(&folder)?))
    }

    /// Overwrite a file's content.
    pub async fn update_content(
        &self,
        file_id_or_url: &str,
        content: String,
        mime_type: String,
    ) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let update = UpdateRequest {
            media: Some(Media {
                body: content,
                mime_type,
            }),
            ..Default::default()
        };

        let file = self.api.update_file(&file_id, update).await?;
        Ok(format!("Updated file:\n{}", to_pretty_json(&file)?))
    }

    pub async fn rename(&self, file_id_or_url: &str, new_name: &str) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let update = UpdateRequest {
            metadata: File {
                name: Some(new_name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let file = self.api.update_file(&file_id, update).await?;
        Ok(format!("Renamed:\n{}", to_pretty_json(&file)?))
    }

    /// Move a file: fetch its current parents, then replace all of them with
    /// the destination in a single update.
    pub async fn move_file(
        &self,
        file_id_or_url: &str,
        destination_folder_id: &str,
    ) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let destination = parse_file_id(destination_folder_id)?;

        let current = self.api.get_file(&file_id, "parents").await?;
        let previous_parents = current.parents.unwrap_or_default().join(",");
        tracing::debug!("moving {file_id} from [{previous_parents}] to {destination}");

        let update = UpdateRequest {
            add_parents: Some(destination),
            remove_parents: (!previous_parents.is_empty()).then_some(previous_parents),
            ..Default::default()
        };
        let file = self.api.update_file(&file_id, update).await?;
        Ok(format!("Moved:\n{}", to_pretty_json(&file)?))
    }

    pub async fn copy(
        &self,
        file_id_or_url: &str,
        new_name: Option<String>,
        folder_id: Option<&str>,
    ) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let folder_id = folder_id.map(parse_file_id).transpose()?;
        let metadata = File {
            name: new_name.filter(|name| !name.is_empty()),
            parents: folder_id.map(|id| vec![id]),
            ..Default::default()
        };

        let file = self.api.copy_file(&file_id, metadata).await?;
        Ok(format!("Copied:\n{}", to_pretty_json(&file)?))
    }

    /// Move a file to the trash. Files are never permanently deleted.
    pub async fn trash(&self, file_id_or_url: &str) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let update = UpdateRequest {
            metadata: File {
                trashed: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };

        let file = self.api.update_file(&file_id, update).await?;
        Ok(format!("Moved to trash:\n{}", to_pretty_json(&file)?))
    }

    /// Grant `role` on a file to one user.
    pub async fn share(
        &self,
        file_id_or_url: &str,
        email: &str,
        role: ShareRole,
        send_notification: bool,
    ) -> Result<String, AppError> {
        let file_id = parse_file_id(file_id_or_url)?;
        let permission = Permission {
            type_: Some("user".to_string()),
            role: Some(role.as_str().to_string()),
            email_address: Some(email.to_string()),
            ..Default::default()
        };

        let created = self
            .api
            .create_permission(&file_id, permission, send_notification)
            .await?;
        Ok(format!(
            "Sharing added:\n  File: {file_id}\n  Shared with: {email}\n  Role: {}\n  Permission ID: {}",
            role.as_str(),
            created.id.as_deref().unwrap_or("unknown"),
        ))
    }
}

/// Requested page size clamped to what the Drive API accepts.
pub fn effective_page_size(requested: u32) -> i32 {
    // Clamped to 1..=100, always fits
    requested.clamp(1, MAX_PAGE_SIZE) as i32
}

/// Export target for Google Workspace types; `None` means download raw.
pub fn export_format(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        GOOGLE_DOC => Some("text/markdown"),
        GOOGLE_SHEET => Some("text/csv"),
        GOOGLE_SLIDE => Some("text/plain"),
        _ => None,
    }
}

fn file_list_text(files: &[File]) -> Result<String, AppError> {
    let files = serde_json::to_value(files)?;
    let count = files.as_array().map_or(0, Vec::len);
    to_pretty_json(&json!({ "files": files, "count": count }))
}

/// Pretty JSON with null fields dropped; the API structs carry every field
/// of the resource, most of them unset.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, AppError> {
    let mut value = serde_json::to_value(value)?;
    strip_nulls(&mut value);
    Ok(serde_json::to_string_pretty(&value)?)
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Extract a Google Drive file ID from a URL or return the input as-is if it
/// looks like a bare ID.
///
/// Supported URL patterns:
/// - `https://docs.google.com/document/d/{ID}/...`
/// - `https://drive.google.com/file/d/{ID}/...`
/// - `https://docs.google.com/spreadsheets/d/{ID}/...`
/// - `https://drive.google.com/drive/folders/{ID}`
/// - `https://drive.google.com/open?id={ID}`
pub fn parse_file_id(input: &str) -> Result<String, AppError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AppError::InvalidInput("file ID cannot be empty".into()));
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        for marker in ["/d/", "/folders/"] {
            if let Some(pos) = input.find(marker) {
                let after = &input[pos + marker.len()..];
                let id = after.split(['/', '?', '#']).next().unwrap_or("");
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }

        if let Some(pos) = input.find("id=") {
            let after = &input[pos + 3..];
            let id = after.split(['&', '#']).next().unwrap_or("");
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }

        return Err(AppError::InvalidInput(format!(
            "could not extract file ID from URL: {input}"
        )));
    }

    // Bare file ID: alphanumeric, hyphens, underscores
    if input
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        Ok(input.to_string())
    } else {
        Err(AppError::InvalidInput(format!(
            "invalid file ID or URL: {input}"
        )))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::fake::{Call, FakeDrive};
    use super::*;

    fn client(fake: FakeDrive) -> (DriveClient, Arc<FakeDrive>) {
        let fake = Arc::new(fake);
        (DriveClient::new(fake.clone()), fake)
    }

    fn update_calls(calls: &[Call]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .count()
    }

    #[test]
    fn parse_google_doc_url() {
        let url = "https://docs.google.com/document/d/1aBcDeFgHiJkLmNoPqRsTuVwXyZ/edit";
        assert_eq!(parse_file_id(url).unwrap(), "1aBcDeFgHiJkLmNoPqRsTuVwXyZ");
    }

    #[test]
    fn parse_drive_file_url() {
        let url = "https://drive.google.com/file/d/1aBcDeFgHiJkLmNoPqRsTuVwXyZ/view?usp=sharing";
        assert_eq!(parse_file_id(url).unwrap(), "1aBcDeFgHiJkLmNoPqRsTuVwXyZ");
    }

    #[test]
    fn parse_folder_url() {
        let url = "https://drive.google.com/drive/folders/0BxFolderId?usp=drive_link";
        assert_eq!(parse_file_id(url).unwrap(), "0BxFolderId");
    }

    #[test]
    fn parse_open_id_url() {
        let url = "https://drive.google.com/open?id=1aBcDeFgHiJkLmNoPqRsTuVwXyZ";
        assert_eq!(parse_file_id(url).unwrap(), "1aBcDeFgHiJkLmNoPqRsTuVwXyZ");
    }

    #[test]
    fn parse_bare_ids() {
        assert_eq!(parse_file_id("root").unwrap(), "root");
        assert_eq!(parse_file_id(" abc_DEF-1 ").unwrap(), "abc_DEF-1");
        assert!(parse_file_id("").is_err());
        assert!(parse_file_id("' or 1=1").is_err());
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(effective_page_size(20), 20);
        assert_eq!(effective_page_size(100), 100);
        assert_eq!(effective_page_size(9999), effective_page_size(100));
        assert_eq!(effective_page_size(0), 1);
    }

    #[test]
    fn export_formats_by_type() {
        assert_eq!(export_format(GOOGLE_DOC), Some("text/markdown"));
        assert_eq!(export_format(GOOGLE_SHEET), Some("text/csv"));
        assert_eq!(export_format(GOOGLE_SLIDE), Some("text/plain"));
        assert_eq!(export_format("application/pdf"), None);
        assert_eq!(export_format(GOOGLE_FOLDER), None);
    }

    #[tokio::test]
    async fn search_clamps_page_size_and_orders_by_recency() {
        let (drive, fake) = client(FakeDrive::default().with_file("a", "A", "text/plain"));
        let text = drive.search("name contains 'report'", 9999).await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![Call::List(ListRequest {
                query: "name contains 'report'".into(),
                page_size: 100,
                order_by: "modifiedTime desc".into(),
            })]
        );
        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["count"], 1);
        assert_eq!(body["files"][0]["name"], "A");
    }

    #[tokio::test]
    async fn list_queries_folder_children() {
        let (drive, fake) = client(FakeDrive::default());
        drive.list("root", 30).await.unwrap();
        assert_eq!(
            fake.calls(),
            vec![Call::List(ListRequest {
                query: "'root' in parents and trashed = false".into(),
                page_size: 30,
                order_by: "folder, name".into(),
            })]
        );
    }

    #[tokio::test]
    async fn read_doc_exports_markdown() {
        let (drive, fake) = client(FakeDrive::default().with_file("doc1", "Notes", GOOGLE_DOC));
        let text = drive.read("doc1").await.unwrap();

        let calls = fake.calls();
        assert!(calls.contains(&Call::Export {
            file_id: "doc1".into(),
            mime_type: "text/markdown".into(),
        }));
        assert!(!calls.iter().any(|c| matches!(c, Call::Download { .. })));
        assert_eq!(
            text,
            format!("--- File: Notes ({GOOGLE_DOC}) ---\n\nexported doc1 as text/markdown")
        );
    }

    #[tokio::test]
    async fn read_sheet_and_slides_export() {
        let (drive, fake) = client(
            FakeDrive::default()
                .with_file("s", "Sheet", GOOGLE_SHEET)
                .with_file("p", "Deck", GOOGLE_SLIDE),
        );
        drive.read("s").await.unwrap();
        drive.read("p").await.unwrap();

        let exports: Vec<_> = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Export { .. }))
            .collect();
        assert_eq!(
            exports,
            vec![
                Call::Export {
                    file_id: "s".into(),
                    mime_type: "text/csv".into()
                },
                Call::Export {
                    file_id: "p".into(),
                    mime_type: "text/plain".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn read_other_types_downloads() {
        let (drive, fake) =
            client(FakeDrive::default().with_file("pdf", "paper.pdf", "application/pdf"));
        let text = drive
            .read("https://drive.google.com/file/d/pdf/view")
            .await
            .unwrap();

        let calls = fake.calls();
        assert!(calls.contains(&Call::Download {
            file_id: "pdf".into()
        }));
        assert!(!calls.iter().any(|c| matches!(c, Call::Export { .. })));
        assert!(text.starts_with("--- File: paper.pdf (application/pdf) ---"));
    }

    #[tokio::test]
    async fn read_batch_keeps_input_order() {
        // The first file answers last
        let (drive, _fake) = client(
            FakeDrive::default()
                .with_file("slow", "Slow", "text/plain")
                .with_file("fast", "Fast", "text/plain")
                .with_delay("slow", Duration::from_millis(50)),
        );
        let text = drive
            .read_batch(&["slow".to_string(), "fast".to_string()])
            .await
            .unwrap();

        let slow = text.find("--- File: Slow").unwrap();
        let fast = text.find("--- File: Fast").unwrap();
        assert!(slow < fast);
    }

    #[tokio::test]
    async fn read_batch_rejects_empty_input() {
        let (drive, fake) = client(FakeDrive::default());
        let err = drive.read_batch(&[]).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn create_with_conversion_forces_native_type() {
        let (drive, fake) = client(FakeDrive::default());
        drive
            .create_file(NewFile {
                name: "Budget".into(),
                content: "a,b\n1,2".into(),
                folder_id: Some("folder1".into()),
                convert_to: Some(ConvertTo::Spreadsheet),
                mime_type: "text/csv".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![Call::Create {
                metadata: json!({
                    "name": "Budget",
                    "parents": ["folder1"],
                    "mimeType": GOOGLE_SHEET,
                }),
                media: Media {
                    body: "a,b\n1,2".into(),
                    mime_type: "text/csv".into(),
                },
            }]
        );
    }

    #[tokio::test]
    async fn create_without_conversion_leaves_type_unset() {
        let (drive, fake) = client(FakeDrive::default());
        drive
            .create_file(NewFile {
                name: "notes.txt".into(),
                content: "hi".into(),
                folder_id: None,
                convert_to: None,
                mime_type: "text/plain".into(),
            })
            .await
            .unwrap();

        match &fake.calls()[0] {
            Call::Create { metadata, media } => {
                assert_eq!(metadata, &json!({"name": "notes.txt"}));
                assert_eq!(media.mime_type, "text/plain");
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_folder_uploads_empty_body() {
        let (drive, fake) = client(FakeDrive::default());
        drive.create_folder("Reports", Some("parent")).await.unwrap();
        assert_eq!(
            fake.calls(),
            vec![Call::Create {
                metadata: json!({
                    "name": "Reports",
                    "mimeType": GOOGLE_FOLDER,
                    "parents": ["parent"],
                }),
                media: Media {
                    body: String::new(),
                    mime_type: "application/octet-stream".into(),
                },
            }]
        );
        assert_eq!(
            parse_mime(&Media::empty().mime_type).unwrap(),
            mime::APPLICATION_OCTET_STREAM
        );
    }

    #[tokio::test]
    async fn move_replaces_every_parent() {
        let (drive, fake) = client(FakeDrive::default().with_parents("f1", &["p1", "p2", "p3"]));
        drive.move_file("f1", "dest").await.unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                Call::Get {
                    file_id: "f1".into(),
                    fields: "parents".into(),
                },
                Call::Update {
                    file_id: "f1".into(),
                    metadata: json!({}),
                    media: None,
                    add_parents: Some("dest".into()),
                    remove_parents: Some("p1,p2,p3".into()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn move_without_parents_only_adds() {
        let (drive, fake) = client(FakeDrive::default());
        drive.move_file("orphan", "dest").await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        match &calls[1] {
            Call::Update {
                add_parents,
                remove_parents,
                ..
            } => {
                assert_eq!(add_parents.as_deref(), Some("dest"));
                assert_eq!(remove_parents, &None);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_only_trashes() {
        let (drive, fake) = client(FakeDrive::default());
        let text = drive.trash("f1").await.unwrap();

        let calls = fake.calls();
        assert_eq!(update_calls(&calls), 1);
        assert_eq!(
            calls,
            vec![Call::Update {
                file_id: "f1".into(),
                metadata: json!({"trashed": true}),
                media: None,
                add_parents: None,
                remove_parents: None,
            }]
        );
        assert!(text.starts_with("Moved to trash:"));
    }

    #[tokio::test]
    async fn rename_and_update_content() {
        let (drive, fake) = client(FakeDrive::default());
        drive.rename("f1", "new.txt").await.unwrap();
        drive
            .update_content("f1", "body".into(), "text/markdown".into())
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(
            calls[0],
            Call::Update {
                file_id: "f1".into(),
                metadata: json!({"name": "new.txt"}),
                media: None,
                add_parents: None,
                remove_parents: None,
            }
        );
        assert_eq!(
            calls[1],
            Call::Update {
                file_id: "f1".into(),
                metadata: json!({}),
                media: Some(Media {
                    body: "body".into(),
                    mime_type: "text/markdown".into(),
                }),
                add_parents: None,
                remove_parents: None,
            }
        );
    }

    #[tokio::test]
    async fn copy_ignores_empty_name() {
        let (drive, fake) = client(FakeDrive::default());
        drive.copy("f1", Some(String::new()), Some("dest")).await.unwrap();
        assert_eq!(
            fake.calls(),
            vec![Call::Copy {
                file_id: "f1".into(),
                metadata: json!({"parents": ["dest"]}),
            }]
        );
    }

    #[tokio::test]
    async fn share_creates_one_user_permission() {
        let (drive, fake) = client(FakeDrive::default());
        let text = drive
            .share("f1", "a@example.com", ShareRole::Writer, false)
            .await
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![Call::Permission {
                file_id: "f1".into(),
                permission: json!({
                    "type": "user",
                    "role": "writer",
                    "emailAddress": "a@example.com",
                }),
                send_notification: false,
            }]
        );
        assert!(text.contains("Permission ID: perm-1"));
        assert!(text.contains("Role: writer"));
    }

    #[tokio::test]
    async fn remote_errors_propagate_unchanged() {
        let fake = FakeDrive {
            fail_with: Some("404 File not found".into()),
            ..Default::default()
        };
        let (drive, fake) = client(fake);
        let err = drive.metadata("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "Drive API error: 404 File not found");
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn invalid_ids_fail_before_remote_calls() {
        let (drive, fake) = client(FakeDrive::default());
        assert!(drive.trash("not a valid id!").await.is_err());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn strip_nulls_recurses() {
        let mut value = json!({"a": null, "b": {"c": null, "d": 1}, "e": [{"f": null}]});
        strip_nulls(&mut value);
        assert_eq!(value, json!({"b": {"d": 1}, "e": [{}]}));
    }
}
