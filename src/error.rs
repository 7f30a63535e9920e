use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not authenticated: no token file at {0}. Run `gdrive-mcp auth` first")]
    NotAuthenticated(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("OAuth authorization denied: {0}")]
    OAuthDenied(String),

    #[error("no authorization code received in OAuth callback")]
    MissingAuthorizationCode,

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Drive API error: {0}")]
    DriveApi(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("OAuth2 error: {0}")]
    OAuth2(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
