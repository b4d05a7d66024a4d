use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};

use md5::Context;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("failed to resolve absolute path for {path:?}: {source}")]
    Absolute { path: PathBuf, source: io::Error },
}

/// Absolute, lexically normalized form used as the archive key.
///
/// Case is folded on Windows where the filesystem is case-insensitive.
pub fn canonical_path(path: &Path) -> Result<PathBuf, PathError> {
    if path.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    let absolute = std::path::absolute(path).map_err(|source| PathError::Absolute {
        path: path.to_path_buf(),
        source,
    })?;

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => continue,
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(fold_case(out))
}

#[cfg(windows)]
fn fold_case(path: PathBuf) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(not(windows))]
fn fold_case(path: PathBuf) -> PathBuf {
    path
}

/// String form of `path` for archive lookups and path comparisons; folded
/// the same way as [`canonical_path`].
pub fn path_key(path: &Path) -> String {
    fold_case(path.to_path_buf()).to_string_lossy().into_owned()
}

/// `true` when `path` is `ancestor` or lies below it, compared by
/// [`path_key`].
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    Path::new(&path_key(path)).starts_with(path_key(ancestor))
}

pub fn modified_ns(meta: &Metadata) -> io::Result<i64> {
    let modified = OffsetDateTime::from(meta.modified()?);
    Ok(clamp_nanos(modified.unix_timestamp_nanos()))
}

pub fn datetime_ns(value: OffsetDateTime) -> i64 {
    clamp_nanos(value.unix_timestamp_nanos())
}

fn clamp_nanos(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub async fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = Context::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
