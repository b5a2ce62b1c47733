//! File operations for Pipedrop.
//!
//! This module handles:
//! - File metadata and deterministic file ids
//! - Folder aggregates (running totals across folder members)
//! - Enumerating local files and folders for sending
//! - Streaming reads in network-sized chunks ([`StreamingFileReader`])
//! - Path sanitization

pub mod reader;

pub use reader::{NetworkChunk, StreamingFileReader};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// Derive the id of a file from its name, size and relative path.
///
/// The id is stable across sessions, so a resumed request for the same file
/// matches the sender's announcement.
#[must_use]
pub fn derive_file_id(name: &str, size: u64, full_relative_path: &str) -> String {
    let key = format!("{name}|{size}|{full_relative_path}");
    format!("{:016x}", xxh3_64(key.as_bytes()))
}

/// Metadata of an announced file. Immutable once announced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Deterministic id, see [`derive_file_id`]
    pub file_id: String,
    /// File name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type
    pub mime_type: String,
    /// Path relative to the shared root, `/`-separated
    pub full_relative_path: String,
    /// Folder the file belongs to (empty for standalone files)
    #[serde(default)]
    pub folder_name: String,
}

impl FileMetadata {
    /// Create metadata, deriving the file id.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        full_relative_path: impl Into<String>,
        folder_name: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let full_relative_path = full_relative_path.into();
        Self {
            file_id: derive_file_id(&name, size, &full_relative_path),
            name,
            size,
            mime_type: mime_type.into(),
            full_relative_path,
            folder_name: folder_name.into(),
        }
    }

    /// Whether the file is a member of a folder.
    #[must_use]
    pub fn is_in_folder(&self) -> bool {
        !self.folder_name.is_empty()
    }

    /// Number of network chunks over the whole file.
    #[must_use]
    pub fn total_chunks(&self, chunk_size: usize) -> u64 {
        self.size.div_ceil(chunk_size as u64)
    }

    /// Relative path as a platform path.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        self.full_relative_path.split('/').collect()
    }
}

/// Running totals for one folder.
///
/// Members are added as their metadata is announced or arrives, so the total
/// grows monotonically and is never known up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderAggregate {
    /// Sum of all member sizes seen so far
    pub total_size: u64,
    /// Member file ids in announcement order
    pub member_file_ids: Vec<String>,
    /// Bytes received or sent across members
    pub received_or_sent_size: u64,
}

impl FolderAggregate {
    /// Add a member, returning false if it was already known.
    pub fn add_member(&mut self, meta: &FileMetadata) -> bool {
        if self.member_file_ids.iter().any(|id| id == &meta.file_id) {
            return false;
        }
        self.member_file_ids.push(meta.file_id.clone());
        self.total_size += meta.size;
        true
    }
}

/// Folder aggregates keyed by folder name.
#[derive(Debug, Clone, Default)]
pub struct FolderRegistry {
    folders: HashMap<String, FolderAggregate>,
}

impl FolderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file; no-op for standalone files.
    ///
    /// Returns true if the file was new to its folder.
    pub fn record(&mut self, meta: &FileMetadata) -> bool {
        if !meta.is_in_folder() {
            return false;
        }
        self.folders
            .entry(meta.folder_name.clone())
            .or_default()
            .add_member(meta)
    }

    /// Look up a folder.
    #[must_use]
    pub fn get(&self, folder_name: &str) -> Option<&FolderAggregate> {
        self.folders.get(folder_name)
    }

    /// Look up a folder mutably.
    pub fn get_mut(&mut self, folder_name: &str) -> Option<&mut FolderAggregate> {
        self.folders.get_mut(folder_name)
    }

    /// Drop every folder.
    pub fn clear(&mut self) {
        self.folders.clear();
    }
}

/// A local file offered to peers.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    /// Metadata announced to peers
    pub metadata: FileMetadata,
    /// Location on the local filesystem
    pub source: PathBuf,
}

impl OutgoingFile {
    /// Build an outgoing file from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be inspected.
    pub fn from_path(path: &Path, relative: &Path, folder_name: &str) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
            .to_string();

        let full_relative_path = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        let mime_type = mime_guess::from_path(path)
            .first()
            .map_or_else(|| "application/octet-stream".to_string(), |m| m.to_string());

        Ok(Self {
            metadata: FileMetadata::new(
                name,
                metadata.len(),
                mime_type,
                full_relative_path,
                folder_name,
            ),
            source: path.to_path_buf(),
        })
    }
}

/// Enumerate files and folders to offer.
///
/// A file argument becomes a standalone file. A directory argument becomes a
/// folder named after the directory; every non-hidden regular file beneath it
/// is a member, in path order.
///
/// # Errors
///
/// Returns an error if a path does not exist or cannot be read.
pub fn enumerate_outgoing(paths: &[PathBuf]) -> Result<Vec<OutgoingFile>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            let name = path
                .file_name()
                .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
            files.push(OutgoingFile::from_path(path, Path::new(name), "")?);
        } else if path.is_dir() {
            enumerate_directory(path, &mut files)?;
        } else {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
    }

    Ok(files)
}

fn enumerate_directory(dir: &Path, files: &mut Vec<OutgoingFile>) -> Result<()> {
    let folder_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(dir.display().to_string()))?
        .to_string();
    let base = dir.parent().unwrap_or(dir);

    let walker = walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.'))
        });

    for entry in walker.filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(path);
        files.push(OutgoingFile::from_path(path, relative, &folder_name)?);
    }

    Ok(())
}

/// Sanitize a path to prevent directory traversal attacks.
///
/// # Arguments
///
/// * `base` - Base directory
/// * `relative` - Relative path from base
///
/// # Returns
///
/// The sanitized absolute path, or None if the path escapes `base`.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
