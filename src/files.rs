//! Capability-scoped file access helpers.
//!
//! Every read and write goes through a `cap_std` directory handle opened on
//! the file's parent, so path components after the parent cannot escape it.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Error raised by the helpers in this module.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{path}: {message}")]
pub struct FileError {
    /// Path that failed.
    pub path: String,
    /// Underlying error message.
    pub message: String,
    /// Whether the failure was a missing file or directory.
    pub not_found: bool,
}

impl FileError {
    fn new(path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            path: path.to_string(),
            message: err.to_string(),
            not_found: err.kind() == io::ErrorKind::NotFound,
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| FileError {
        path: path.to_string(),
        message: String::from("path is missing a file name"),
        not_found: false,
    })?;
    Ok((parent, file_name))
}

fn open_parent(parent: &Utf8Path) -> Result<Dir, FileError> {
    Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| FileError::new(parent, &err))
}

/// Reads a UTF-8 file.
///
/// # Errors
///
/// Returns [`FileError`] when the parent cannot be opened or the file read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FileError> {
    let (parent, file_name) = split(path)?;
    open_parent(parent)?
        .read_to_string(file_name)
        .map_err(|err| FileError::new(path, &err))
}

/// Writes `contents`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`FileError`] when a directory cannot be created or the write
/// fails.
pub fn write(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    create_dir_all(parent)?;
    open_parent(parent)?
        .write(file_name, contents)
        .map_err(|err| FileError::new(path, &err))
}

/// Returns whether `path` exists. A missing parent counts as absent.
///
/// # Errors
///
/// Returns [`FileError`] for failures other than "not found".
pub fn exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| FileError::new(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::new(parent, &err)),
    }
}

/// Creates `path` and all missing ancestors.
///
/// # Errors
///
/// Returns [`FileError`] when creation fails.
pub fn create_dir_all(path: &Utf8Path) -> Result<(), FileError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| FileError::new(path, &err))
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
