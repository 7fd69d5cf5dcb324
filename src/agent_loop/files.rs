//! File lookup collaborators and cited-file resolution.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::FileSearchSettings;
use crate::error::{EngineError, Result};

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A semantic search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub file_id: String,
    pub score: f32,
}

/// A file reported on the completion event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitedFile {
    pub file_name: String,
    pub file_id: String,
}

impl From<FileMetadata> for CitedFile {
    fn from(meta: FileMetadata) -> Self {
        Self {
            file_name: meta.file_name,
            file_id: meta.file_id,
        }
    }
}

/// Looks up stored files by id. `Ok(None)` means the file does not exist
/// (or is not visible to the user).
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn get_file(&self, file_id: &str, user_id: Option<&str>) -> Result<Option<FileMetadata>>;
}

/// Finds the files most relevant to a query for a user.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<FileMatch>>;
}

/// Resolve every manual attachment. Any attachment that cannot be resolved
/// fails the request.
pub async fn validate_attachments(
    resolver: &dyn FileResolver,
    attachments: &[String],
    user_id: Option<&str>,
) -> Result<Vec<CitedFile>> {
    let mut files = Vec::with_capacity(attachments.len());
    for file_id in attachments {
        match resolver.get_file(file_id, user_id).await {
            Ok(Some(meta)) => files.push(meta.into()),
            Ok(None) => {
                return Err(EngineError::InvalidAttachment {
                    file_id: file_id.clone(),
                })
            }
            Err(err) => {
                warn!(file_id = %file_id, error = %err, "attachment lookup failed");
                return Err(EngineError::InvalidAttachment {
                    file_id: file_id.clone(),
                });
            }
        }
    }
    Ok(files)
}

/// Run semantic search and resolve the hits. Search failures yield no files;
/// hits that no longer resolve are skipped.
pub async fn search_cited_files(
    search: &dyn SemanticSearch,
    resolver: &dyn FileResolver,
    user_id: &str,
    query: &str,
    settings: &FileSearchSettings,
) -> Vec<CitedFile> {
    let limit = settings.max_files.unwrap_or(5);
    let threshold = settings.threshold.unwrap_or(0.7);
    let matches = match search.search(user_id, query, limit, threshold).await {
        Ok(matches) => matches,
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "semantic file search failed");
            return Vec::new();
        }
    };
    debug!(user_id = %user_id, hits = matches.len(), "semantic file search finished");

    let mut files: Vec<CitedFile> = Vec::new();
    for hit in matches.into_iter().take(limit) {
        if files.iter().any(|f| f.file_id == hit.file_id) {
            continue;
        }
        match resolver.get_file(&hit.file_id, Some(user_id)).await {
            Ok(Some(meta)) => files.push(meta.into()),
            Ok(None) => {
                warn!(file_id = %hit.file_id, "search hit no longer resolves; skipping");
            }
            Err(err) => {
                warn!(file_id = %hit.file_id, error = %err, "search hit lookup failed; skipping");
            }
        }
    }
    files
}

/// Name to id map used to resolve inline citations.
pub fn file_ids_by_name(files: &[CitedFile]) -> HashMap<String, String> {
    files
        .iter()
        .map(|f| (f.file_name.clone(), f.file_id.clone()))
        .collect()
}

/// Resolver backed by a map, for embedders without a file store and for tests.
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    files: Mutex<HashMap<String, FileMetadata>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, file_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        self.insert(FileMetadata {
            file_id: file_id.into(),
            file_name: file_name.into(),
            mime_type: None,
        });
        self
    }

    pub fn insert(&self, meta: FileMetadata) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(meta.file_id.clone(), meta);
        }
    }

    pub fn remove(&self, file_id: &str) -> Option<FileMetadata> {
        self.files.lock().ok()?.remove(file_id)
    }
}

#[async_trait]
impl FileResolver for InMemoryFileStore {
    async fn get_file(&self, file_id: &str, _user_id: Option<&str>) -> Result<Option<FileMetadata>> {
        let files = self
            .files
            .lock()
            .map_err(|_| EngineError::Persistence("file store lock poisoned".into()))?;
        Ok(files.get(file_id).cloned())
    }
}
