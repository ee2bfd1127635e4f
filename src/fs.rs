//! Filesystem capability used by nodes, builds and transforms.
//!
//! Every asynchronous operation suspends the calling task instead of blocking
//! the runtime. The synchronous `*_sync` variants exist for node cleanup,
//! which must not yield between listing and removing stale output.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ErrorCode, GobbleError};

/// Creates a directory and all of its missing parents.
pub async fn mkdir(path: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| GobbleError::io(path, err))
}

/// Lists the entry names of a directory, sorted.
pub async fn readdir(path: impl AsRef<Utf8Path>) -> Result<Vec<String>, GobbleError> {
    let path = path.as_ref();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|err| GobbleError::io(path, err))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| GobbleError::io(path, err))?
    {
        names.push(entry_name(path, entry.file_name())?);
    }

    names.sort();
    Ok(names)
}

/// Removes a file or a directory tree. A missing path is not an error.
pub async fn rimraf(path: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
    let path = path.as_ref();
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) => Err(err),
    };

    ignore_missing(path, result)
}

/// Ensures `dir` exists and is empty.
pub async fn cleanup(dir: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
    let dir = dir.as_ref();
    mkdir(dir).await?;

    for name in readdir(dir).await? {
        rimraf(dir.join(name)).await?;
    }

    Ok(())
}

pub async fn read_to_string(path: impl AsRef<Utf8Path>) -> Result<String, GobbleError> {
    let path = path.as_ref();
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| GobbleError::io(path, err))
}

/// Writes a file, creating its parent directories first.
pub async fn write(
    path: impl AsRef<Utf8Path>,
    contents: impl AsRef<[u8]>,
) -> Result<(), GobbleError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        mkdir(parent).await?;
    }

    tokio::fs::write(path, contents)
        .await
        .map_err(|err| GobbleError::io(path, err))
}

/// Starts a recursive copy; finish it with [`CopyDir::to`].
pub fn copydir(src: impl AsRef<Utf8Path>) -> CopyDir {
    CopyDir {
        src: src.as_ref().to_path_buf(),
    }
}

#[must_use = "nothing is copied until `to` is awaited"]
#[derive(Debug, Clone)]
pub struct CopyDir {
    src: Utf8PathBuf,
}

impl CopyDir {
    /// Copies the contents of the source directory into `dest`, creating it
    /// when missing and overwriting files that already exist there.
    pub async fn to(self, dest: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
        let src = self.src;
        let dest = dest.as_ref().to_path_buf();

        let task = {
            let src = src.clone();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || copy_rec(&src, &dest))
        };

        match task.await {
            Ok(result) => result.map_err(|err| GobbleError::io(&src, err)),
            Err(err) => Err(GobbleError::new(
                ErrorCode::Io,
                format!("copying {src} to {dest} did not finish: {err}"),
            )
            .with_path(&src)),
        }
    }
}

fn copy_rec(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> std::io::Result<()> {
    fs::create_dir_all(&dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.as_ref().join(entry.file_name());

        if entry.file_type()?.is_dir() {
            copy_rec(entry.path(), target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }

    Ok(())
}

pub fn readdir_sync(path: impl AsRef<Utf8Path>) -> Result<Vec<String>, GobbleError> {
    let path = path.as_ref();
    let mut names = Vec::new();

    for entry in fs::read_dir(path).map_err(|err| GobbleError::io(path, err))? {
        let entry = entry.map_err(|err| GobbleError::io(path, err))?;
        names.push(entry_name(path, entry.file_name())?);
    }

    names.sort();
    Ok(names)
}

pub fn rimraf_sync(path: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
    let path = path.as_ref();
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };

    ignore_missing(path, result)
}

fn ignore_missing(path: &Utf8Path, result: std::io::Result<()>) -> Result<(), GobbleError> {
    match result {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(GobbleError::io(path, err)),
        _ => Ok(()),
    }
}

fn entry_name(dir: &Utf8Path, name: std::ffi::OsString) -> Result<String, GobbleError> {
    name.into_string().map_err(|name| {
        GobbleError::new(
            ErrorCode::Io,
            format!("{dir} contains a non UTF-8 entry: {}", name.to_string_lossy()),
        )
        .with_path(dir)
    })
}

/// Handle to this module's operations, handed to transforms through their
/// context.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs;

impl Fs {
    pub async fn mkdir(&self, path: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
        mkdir(path).await
    }

    pub async fn readdir(&self, path: impl AsRef<Utf8Path>) -> Result<Vec<String>, GobbleError> {
        readdir(path).await
    }

    pub async fn rimraf(&self, path: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
        rimraf(path).await
    }

    pub async fn cleanup(&self, dir: impl AsRef<Utf8Path>) -> Result<(), GobbleError> {
        cleanup(dir).await
    }

    pub async fn read_to_string(&self, path: impl AsRef<Utf8Path>) -> Result<String, GobbleError> {
        read_to_string(path).await
    }

    pub async fn write(
        &self,
        path: impl AsRef<Utf8Path>,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), GobbleError> {
        write(path, contents).await
    }

    pub fn copydir(&self, src: impl AsRef<Utf8Path>) -> CopyDir {
        copydir(src)
    }
}
