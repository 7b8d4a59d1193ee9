//! Repository connection file consumed by the snapshot tool.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tasks::config::RepositoryConfig;
use crate::tasks::types::Result;

pub const REPOSITORY_FILE_NAME: &str = "repository.config";

const MAX_CACHE_BYTES: u64 = 5_242_880_000;
const LIST_CACHE_SECONDS: u32 = 30;
const FORMAT_BLOB_CACHE_NANOS: u64 = 900_000_000_000;
const REPOSITORY_USER: &str = "backup-controller";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryFile {
    pub storage: Storage,
    pub caching: Caching,
    pub hostname: String,
    pub username: String,
    pub description: String,
    pub enable_actions: bool,
    pub format_blob_cache_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: S3Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    pub bucket: String,
    pub endpoint: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caching {
    pub cache_directory: String,
    pub max_cache_size: u64,
    pub max_metadata_cache_size: u64,
    pub max_list_cache_duration: u32,
}

impl RepositoryFile {
    pub fn s3(repository: &RepositoryConfig, hostname: &str, cache_dir: &Path) -> Self {
        Self {
            storage: Storage {
                kind: "s3".to_string(),
                config: S3Storage {
                    bucket: repository.bucket.clone(),
                    endpoint: repository.endpoint.clone(),
                    access_key_id: repository.access_key_id.clone(),
                    secret_access_key: repository.secret_access_key.clone(),
                    session_token: String::new(),
                },
            },
            caching: Caching {
                cache_directory: cache_dir.display().to_string(),
                max_cache_size: MAX_CACHE_BYTES,
                max_metadata_cache_size: MAX_CACHE_BYTES,
                max_list_cache_duration: LIST_CACHE_SECONDS,
            },
            hostname: hostname.to_string(),
            username: REPOSITORY_USER.to_string(),
            description: format!(
                "Repository in S3: {} {}",
                repository.endpoint, repository.bucket
            ),
            enable_actions: false,
            format_blob_cache_duration: FORMAT_BLOB_CACHE_NANOS,
        }
    }

    pub fn path_in(config_dir: &Path) -> PathBuf {
        config_dir.join(REPOSITORY_FILE_NAME)
    }

    /// Write the file into `config_dir`, readable by the owner only.
    pub async fn write_to(&self, config_dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(config_dir);
        let contents = serde_json::to_vec(self)?;
        tokio::fs::write(&path, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(path)
    }
}
