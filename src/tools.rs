use std::future::Future;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::ErrorData as McpError;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::drive::{ConvertTo, DriveClient, NewFile, ShareRole};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct DriveService {
    drive: Arc<DriveClient>,
    /// Held for the whole of each tool call; invocations run one at a time
    /// in arrival order.
    dispatch: Arc<Mutex<()>>,
    tool_router: ToolRouter<Self>,
}

fn default_search_page_size() -> u32 {
    20
}

fn default_list_page_size() -> u32 {
    30
}

fn default_folder() -> String {
    "root".into()
}

fn default_mime_type() -> String {
    "text/plain".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParam {
    #[schemars(
        description = "Drive search query, e.g. \"name contains 'report'\" or \"fullText contains 'keyword'\""
    )]
    pub query: String,
    #[serde(default = "default_search_page_size")]
    #[schemars(description = "Number of results (default 20, max 100)")]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListParam {
    #[serde(default = "default_folder")]
    #[schemars(description = "Folder ID or URL (default: root = top of My Drive)")]
    pub folder_id: String,
    #[serde(default = "default_list_page_size")]
    #[schemars(description = "Number of results (default 30, max 100)")]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileIdParam {
    #[schemars(
        description = "A Google Drive file ID or full URL (e.g. https://docs.google.com/document/d/FILE_ID/edit)"
    )]
    pub file_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadBatchParam {
    #[schemars(description = "File IDs or URLs to read (1 to 20); results keep this order")]
    pub file_ids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileParam {
    #[schemars(description = "File name")]
    pub name: String,
    #[schemars(description = "File content (text, Markdown, CSV, ...)")]
    pub content: String,
    #[schemars(description = "Destination folder ID (default: top of My Drive)")]
    pub folder_id: Option<String>,
    #[schemars(
        description = "Create as a Google Workspace file: document (Docs), spreadsheet (Sheets) or presentation (Slides)"
    )]
    pub convert_to: Option<ConvertTo>,
    #[serde(default = "default_mime_type")]
    #[schemars(description = "MIME type of the uploaded content (default: text/plain)")]
    pub mime_type: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderParam {
    #[schemars(description = "Folder name")]
    pub name: String,
    #[schemars(description = "Parent folder ID (default: top of My Drive)")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileParam {
    #[schemars(description = "ID of the file to overwrite")]
    pub file_id: String,
    #[schemars(description = "New file content")]
    pub content: String,
    #[serde(default = "default_mime_type")]
    #[schemars(description = "MIME type of the content (default: text/plain)")]
    pub mime_type: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenameParam {
    #[schemars(description = "File or folder ID")]
    pub file_id: String,
    #[schemars(description = "New name")]
    pub new_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveParam {
    #[schemars(description = "ID of the file or folder to move")]
    pub file_id: String,
    #[schemars(description = "ID of the destination folder")]
    pub destination_folder_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CopyParam {
    #[schemars(description = "ID of the file to copy")]
    pub file_id: String,
    #[schemars(description = "Name of the copy (default: \"Copy of <original>\")")]
    pub new_name: Option<String>,
    #[schemars(description = "Destination folder ID")]
    pub folder_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareParam {
    #[schemars(description = "ID of the file or folder to share")]
    pub file_id: String,
    #[schemars(description = "Email address to share with")]
    pub email: String,
    #[serde(default)]
    #[schemars(
        description = "Role: reader (view), commenter (comment), writer (edit), organizer (manage; shared drives)"
    )]
    pub role: ShareRole,
    #[serde(default = "default_true")]
    #[schemars(description = "Send a notification email (default: true)")]
    pub send_notification: bool,
}

/// Wrap an operation result as a single text block. Remote failures become
/// error results; arguments the operation could not use are rejected as
/// invalid params.
fn text_result(result: Result<String, AppError>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
        Err(AppError::InvalidInput(msg)) => Err(McpError::invalid_params(msg, None)),
        Err(e) => {
            tracing::warn!("tool call failed: {e}");
            Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
        }
    }
}

impl DriveService {
    async fn run_exclusive<F>(&self, operation: F) -> Result<CallToolResult, McpError>
    where
        F: Future<Output = Result<String, AppError>>,
    {
        let _turn = self.dispatch.lock().await;
        text_result(operation.await)
    }
}

#[tool_router]
impl DriveService {
    pub fn new(drive: Arc<DriveClient>) -> Self {
        Self {
            drive,
            dispatch: Arc::new(Mutex::new(())),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "gdrive_search",
        description = "Search files in Google Drive using Drive query syntax. Newest first."
    )]
    async fn gdrive_search(
        &self,
        Parameters(params): Parameters<SearchParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.search(&params.query, params.page_size))
            .await
    }

    #[tool(
        name = "gdrive_list",
        description = "List the files and folders inside a folder (trashed items excluded)."
    )]
    async fn gdrive_list(
        &self,
        Parameters(params): Parameters<ListParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.list(&params.folder_id, params.page_size))
            .await
    }

    #[tool(
        name = "gdrive_read",
        description = "Read a file's content. Google Docs are exported as Markdown, \
                        Sheets as CSV and Slides as plain text; other files are downloaded as-is."
    )]
    async fn gdrive_read(
        &self,
        Parameters(params): Parameters<FileIdParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.read(&params.file_id)).await
    }

    #[tool(
        name = "gdrive_read_batch",
        description = "Read several files at once (same conversion rules as gdrive_read). \
                        Sections are returned in the order the IDs were given."
    )]
    async fn gdrive_read_batch(
        &self,
        Parameters(params): Parameters<ReadBatchParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.read_batch(&params.file_ids)).await
    }

    #[tool(
        name = "gdrive_get_metadata",
        description = "Get metadata for a file or folder: name, size, timestamps, parents, owners and sharing."
    )]
    async fn gdrive_get_metadata(
        &self,
        Parameters(params): Parameters<FileIdParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.metadata(&params.file_id)).await
    }

    #[tool(
        name = "gdrive_create_file",
        description = "Create a new file from text content, optionally as a Google Doc, Sheet or Slides file."
    )]
    async fn gdrive_create_file(
        &self,
        Parameters(params): Parameters<CreateFileParam>,
    ) -> Result<CallToolResult, McpError> {
        let new_file = NewFile {
            name: params.name,
            content: params.content,
            folder_id: params.folder_id,
            convert_to: params.convert_to,
            mime_type: params.mime_type,
        };
        self.run_exclusive(self.drive.create_file(new_file)).await
    }

    #[tool(name = "gdrive_create_folder", description = "Create a new folder.")]
    async fn gdrive_create_folder(
        &self,
        Parameters(params): Parameters<CreateFolderParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(
            self.drive
                .create_folder(&params.name, params.parent_id.as_deref()),
        )
        .await
    }

    #[tool(
        name = "gdrive_update_file",
        description = "Overwrite the content of an existing file."
    )]
    async fn gdrive_update_file(
        &self,
        Parameters(params): Parameters<UpdateFileParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.update_content(
            &params.file_id,
            params.content,
            params.mime_type,
        ))
        .await
    }

    #[tool(name = "gdrive_rename", description = "Rename a file or folder.")]
    async fn gdrive_rename(
        &self,
        Parameters(params): Parameters<RenameParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.rename(&params.file_id, &params.new_name))
            .await
    }

    #[tool(
        name = "gdrive_move",
        description = "Move a file or folder into another folder, removing it from all current parents."
    )]
    async fn gdrive_move(
        &self,
        Parameters(params): Parameters<MoveParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(
            self.drive
                .move_file(&params.file_id, &params.destination_folder_id),
        )
        .await
    }

    #[tool(name = "gdrive_copy", description = "Copy a file.")]
    async fn gdrive_copy(
        &self,
        Parameters(params): Parameters<CopyParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.copy(
            &params.file_id,
            params.new_name,
            params.folder_id.as_deref(),
        ))
        .await
    }

    #[tool(
        name = "gdrive_delete",
        description = "Move a file or folder to the trash. Nothing is permanently deleted."
    )]
    async fn gdrive_delete(
        &self,
        Parameters(params): Parameters<FileIdParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.trash(&params.file_id)).await
    }

    #[tool(
        name = "gdrive_share",
        description = "Share a file or folder with one user by email."
    )]
    async fn gdrive_share(
        &self,
        Parameters(params): Parameters<ShareParam>,
    ) -> Result<CallToolResult, McpError> {
        self.run_exclusive(self.drive.share(
            &params.file_id,
            &params.email,
            params.role,
            params.send_notification,
        ))
        .await
    }
}

#[tool_handler]
impl ServerHandler for DriveService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Google Drive MCP server: search, list, read (Docs as Markdown, Sheets as CSV, \
                 Slides as text), inspect, create, update, rename, move, copy, trash and share \
                 files in the authenticated user's Drive."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
