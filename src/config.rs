use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Environment variable that overrides the credentials directory.
pub const CREDENTIALS_DIR_ENV: &str = "GDRIVE_MCP_DIR";

const DEFAULT_DIR_NAME: &str = ".gdrive-mcp";
const CLIENT_SECRET_FILE: &str = "gcp-oauth.keys.json";
const TOKEN_FILE: &str = "tokens.json";

pub const OAUTH_REDIRECT_PORT: u16 = 3333;
pub const OAUTH_CALLBACK_PATH: &str = "/callback";

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Where credentials live and how the OAuth redirect is reached.
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials_dir: PathBuf,
    pub redirect_port: u16,
}

impl Config {
    /// Build a configuration from an explicit override, or the per-user default.
    pub fn with_dir(dir: Option<PathBuf>) -> Result<Self, AppError> {
        let credentials_dir = match dir {
            Some(dir) => dir,
            None => default_credentials_dir()?,
        };
        Ok(Self {
            credentials_dir,
            redirect_port: OAUTH_REDIRECT_PORT,
        })
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.credentials_dir
    }

    pub fn client_secret_path(&self) -> PathBuf {
        self.credentials_dir.join(CLIENT_SECRET_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.credentials_dir.join(TOKEN_FILE)
    }

    pub fn redirect_uri(&self) -> String {
        format!(
            "http://localhost:{}{OAUTH_CALLBACK_PATH}",
            self.redirect_port
        )
    }
}

fn default_credentials_dir() -> Result<PathBuf, AppError> {
    let home = dirs::home_dir().ok_or_else(|| {
        AppError::Configuration(format!(
            "cannot determine home directory; set {CREDENTIALS_DIR_ENV}"
        ))
    })?;
    Ok(home.join(DEFAULT_DIR_NAME))
}
