use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use crate::listing::resolve;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub files_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub allowed_extensions: Vec<String>,
    /// Serve `files_dir/<username>` instead of `files_dir` itself.
    pub per_user_dirs: bool,
    pub retry_attempts: u32,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("files_dir", "./downloads")?
            .set_default("data_dir", "./data")?
            .set_default("log_level", "info")?
            .set_default("allowed_extensions", Vec::<String>::new())?
            .set_default("per_user_dirs", false)?
            .set_default("retry_attempts", 3)?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. COURIER_SERVER_PORT=8080,
            // COURIER_ALLOWED_EXTENSIONS="mkv,mp4")
            .add_source(
                Environment::with_prefix("COURIER")
                    .list_separator(",")
                    .with_list_parse_key("allowed_extensions")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }

    /// Directory served to `username`, `None` when the name cannot be used
    /// as a single path segment.
    pub fn user_dir(&self, username: &str) -> Option<PathBuf> {
        if !self.per_user_dirs {
            return Some(self.files_dir.clone());
        }
        if username.contains(['/', '\\']) {
            return None;
        }
        resolve(&self.files_dir, username)
    }
}
