use std::path::{Path, PathBuf};
use std::sync::Arc;

use deeplist_llm::BoxFuture;
use deeplist_storage::ChatId;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use uuid::Uuid;

use super::collaborators::FileUploader;
use super::context::UserIdentity;
use super::error::{BlockingTaskSnafu, CollaboratorResult};
use super::message::{Attachment, PendingFile};
use super::notice::{Notice, Notifier};

pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const UPLOAD_DIRECTORY_NAME: &str = "uploads";

pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
    "application/json",
    "text/plain",
    "text/markdown",
    "text/csv",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
    /// Defaults to `uploads/` under the data directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            allowed_content_types: default_allowed_content_types(),
            directory: None,
        }
    }
}

impl UploadSettings {
    pub fn normalized(mut self) -> Self {
        if self.max_file_size_bytes == 0 {
            self.max_file_size_bytes = DEFAULT_MAX_FILE_SIZE_BYTES;
        }
        self.allowed_content_types = self
            .allowed_content_types
            .into_iter()
            .map(|content_type| content_type.trim().to_ascii_lowercase())
            .filter(|content_type| !content_type.is_empty())
            .collect();
        if self.allowed_content_types.is_empty() {
            self.allowed_content_types = default_allowed_content_types();
        }
        self
    }

    fn allows(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        self.allowed_content_types
            .iter()
            .any(|allowed| *allowed == content_type)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UploadError {
    #[snafu(display("{name} is empty"))]
    EmptyFile { stage: &'static str, name: String },
    #[snafu(display("{name} is {size} bytes; files can be at most {max} bytes"))]
    FileTooLarge {
        stage: &'static str,
        name: String,
        size: u64,
        max: u64,
    },
    #[snafu(display("{name} has unsupported type {content_type}"))]
    UnsupportedType {
        stage: &'static str,
        name: String,
        content_type: String,
    },
    #[snafu(display("failed to create upload directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write upload at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn validate_file(file: &PendingFile, settings: &UploadSettings) -> Result<(), UploadError> {
    const STAGE: &str = "validate-file";

    ensure!(
        !file.bytes.is_empty(),
        EmptyFileSnafu {
            stage: STAGE,
            name: file.name.clone(),
        }
    );
    ensure!(
        file.size() <= settings.max_file_size_bytes,
        FileTooLargeSnafu {
            stage: STAGE,
            name: file.name.clone(),
            size: file.size(),
            max: settings.max_file_size_bytes,
        }
    );
    ensure!(
        settings.allows(&file.content_type),
        UnsupportedTypeSnafu {
            stage: STAGE,
            name: file.name.clone(),
            content_type: file.content_type.clone(),
        }
    );
    Ok(())
}

/// Stores uploads under `<root>/<user>/<chat>/` and hands back `file://` URLs.
pub struct DirectoryUploader {
    root: PathBuf,
    settings: UploadSettings,
    notifier: Arc<dyn Notifier>,
}

impl DirectoryUploader {
    pub fn new(root: PathBuf, settings: UploadSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            root,
            settings: settings.normalized(),
            notifier,
        }
    }

    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(super::settings::SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".deeplist"))
            .join(UPLOAD_DIRECTORY_NAME)
    }

    async fn upload_all(
        &self,
        user: &UserIdentity,
        chat_id: &ChatId,
        files: &[PendingFile],
    ) -> CollaboratorResult<Option<Vec<Attachment>>> {
        for file in files {
            if let Err(error) = validate_file(file, &self.settings) {
                tracing::info!(name = %file.name, %error, "rejected upload");
                self.notifier
                    .notify(Notice::error("File upload failed").with_description(error.to_string()));
                return Ok(None);
            }
        }

        let directory = self
            .root
            .join(path_segment(user.id.as_str()))
            .join(path_segment(chat_id.as_str()));
        let files = files.to_vec();
        let written = tokio::task::spawn_blocking(move || write_files(&directory, &files))
            .await
            .context(BlockingTaskSnafu {
                stage: "write-uploads",
            })?;

        match written {
            Ok(attachments) => Ok(Some(attachments)),
            Err(error) => {
                tracing::warn!(%chat_id, %error, "failed to store uploads");
                self.notifier
                    .notify(Notice::error("File upload failed").with_description(error.to_string()));
                Ok(None)
            }
        }
    }
}

impl FileUploader for DirectoryUploader {
    fn handle_file_uploads<'a>(
        &'a self,
        user: &'a UserIdentity,
        chat_id: &'a ChatId,
        files: &'a [PendingFile],
    ) -> BoxFuture<'a, CollaboratorResult<Option<Vec<Attachment>>>> {
        Box::pin(self.upload_all(user, chat_id, files))
    }
}

fn write_files(directory: &Path, files: &[PendingFile]) -> Result<Vec<Attachment>, UploadError> {
    std::fs::create_dir_all(directory).context(CreateDirSnafu {
        stage: "create-upload-directory",
        path: directory.to_path_buf(),
    })?;

    files
        .iter()
        .map(|file| {
            let path = directory.join(format!("{}-{}", Uuid::new_v4(), path_segment(&file.name)));
            std::fs::write(&path, &file.bytes).context(WriteFileSnafu {
                stage: "write-upload-file",
                path: path.clone(),
            })?;
            Ok(Attachment::persisted(
                file.name.clone(),
                file.content_type.clone(),
                format!("file://{}", path.display()),
            ))
        })
        .collect()
}

/// Keeps ASCII alphanumerics, `.`, `-` and `_`; anything else becomes `_`.
fn path_segment(raw: &str) -> String {
    let segment = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let segment = segment.trim_start_matches('.');
    if segment.is_empty() {
        "file".to_string()
    } else {
        segment.to_string()
    }
}

fn default_max_file_size_bytes() -> u64 {
    DEFAULT_MAX_FILE_SIZE_BYTES
}

fn default_allowed_content_types() -> Vec<String> {
    DEFAULT_ALLOWED_CONTENT_TYPES
        .iter()
        .map(|content_type| content_type.to_string())
        .collect()
}
