use std::path::{Path, PathBuf};

use axum::{
    extract::multipart::{Field, Multipart, MultipartError},
    http::StatusCode,
};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

/// Allowance for multipart framing on top of the file size limit.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

pub const DEFAULT_MAX_FILE_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("Only one file may be uploaded per request")]
    MultipleFiles,
    #[error("Invalid file type. Allowed types: {}", .0.join(", "))]
    InvalidExtension(Vec<String>),
    #[error("File too large. Maximum size is {0} bytes")]
    TooLarge(usize),
    #[error("Malformed multipart request: {0}")]
    Multipart(MultipartError),
    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload acceptance rules and the staging location.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    allowed_extensions: Vec<String>,
    max_file_size: usize,
    upload_dir: PathBuf,
}

impl UploadPolicy {
    pub fn new<I, S>(
        allowed_extensions: I,
        max_file_size: usize,
        upload_dir: impl Into<PathBuf>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_extensions = allowed_extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self {
            allowed_extensions,
            max_file_size,
            upload_dir: upload_dir.into(),
        }
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Request body limit covering a maximum-size file plus multipart framing.
    pub fn body_limit(&self) -> usize {
        self.max_file_size.saturating_add(MULTIPART_OVERHEAD)
    }

    /// Returns the lower-cased extension of `file_name` if it is allowed.
    pub fn allowed_extension(&self, file_name: &str) -> Option<String> {
        let (_, ext) = file_name.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions.contains(&ext).then_some(ext)
    }

    fn multipart_error(&self, err: MultipartError) -> StagingError {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            StagingError::TooLarge(self.max_file_size)
        } else {
            StagingError::Multipart(err)
        }
    }
}

/// A staged upload. The file is deleted by [`UploadedFile::remove`], or on
/// drop if `remove` was never reached.
#[derive(Debug)]
pub struct UploadedFile {
    path: PathBuf,
    original_name: String,
    size_bytes: u64,
    removed: bool,
}

impl UploadedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Deletes the staged file. Failures are logged and otherwise ignored.
    pub async fn remove(mut self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged upload"),
            Err(e) => warn!(path = %self.path.display(), "Error removing staged upload: {e}"),
        }
        self.removed = true;
    }
}

fn remove_abandoned(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed abandoned staged upload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Error removing staged upload: {e}"),
    }
}

impl Drop for UploadedFile {
    /// Inside a runtime the deletion runs on the blocking pool so an
    /// abandoned upload never stalls a worker thread.
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_abandoned(&path));
            }
            Err(_) => remove_abandoned(&path),
        }
    }
}

/// Reads the multipart body and stages its single `file` field under a
/// unique name in the upload directory.
pub async fn stage(
    policy: &UploadPolicy,
    mut multipart: Multipart,
) -> Result<UploadedFile, StagingError> {
    let mut staged = None;
    match read_fields(policy, &mut multipart, &mut staged).await {
        Ok(()) => staged.ok_or(StagingError::MissingFile),
        Err(e) => {
            if let Some(upload) = staged.take() {
                upload.remove().await;
            }
            Err(e)
        }
    }
}

async fn read_fields(
    policy: &UploadPolicy,
    multipart: &mut Multipart,
    staged: &mut Option<UploadedFile>,
) -> Result<(), StagingError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| policy.multipart_error(e))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if staged.is_some() {
            return Err(StagingError::MultipleFiles);
        }
        *staged = Some(write_field(policy, field).await?);
    }
    Ok(())
}

async fn write_field(
    policy: &UploadPolicy,
    mut field: Field<'_>,
) -> Result<UploadedFile, StagingError> {
    let original_name = field
        .file_name()
        .map(str::to_owned)
        .ok_or(StagingError::MissingFile)?;
    let ext = policy
        .allowed_extension(&original_name)
        .ok_or_else(|| StagingError::InvalidExtension(policy.allowed_extensions.clone()))?;

    let path = policy
        .upload_dir
        .join(format!("{}.{ext}", Uuid::new_v4().as_simple()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    let mut upload = UploadedFile {
        path,
        original_name,
        size_bytes: 0,
        removed: false,
    };

    let copied = async {
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| policy.multipart_error(e))?
        {
            upload.size_bytes += chunk.len() as u64;
            if upload.size_bytes > policy.max_file_size as u64 {
                return Err(StagingError::TooLarge(policy.max_file_size));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok::<(), StagingError>(())
    }
    .await;
    drop(file);

    match copied {
        Ok(()) => Ok(upload),
        Err(e) => {
            upload.remove().await;
            Err(e)
        }
    }
}
