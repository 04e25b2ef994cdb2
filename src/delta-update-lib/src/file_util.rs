use log::*;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{UpdateError, UpdateResult};

/// `path` + `suffix`, appended to the file name (not an extension swap).
pub fn append_path_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Length of a regular file, `None` when it does not exist.
pub fn file_len(path: &Path) -> Option<u64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

pub async fn file_len_async(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

/// 去掉已存在文件的只读属性，文件不存在不算错误
pub fn unassign_readonly(path: &Path) {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return,
    };
    let mut perms = meta.permissions();
    if !perms.readonly() {
        return;
    }
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    if let Err(e) = std::fs::set_permissions(path, perms) {
        warn!("unassign readonly for {} failed: {}", path.display(), e);
    }
}

pub async fn remove_file_if_exists(path: &Path) -> UpdateResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(UpdateError::IoError(format!(
            "remove {} failed: {}",
            path.display(),
            e
        ))),
    }
}

pub async fn ensure_dir_exists(dir: &Path) -> UpdateResult<()> {
    if !dir.is_dir() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            UpdateError::IoError(format!("create dir {} failed: {}", dir.display(), e))
        })?;
    }
    if !dir.is_dir() {
        return Err(UpdateError::IoError(format!(
            "dir {} still missing after create",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote 0 bytes"));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "seek_read hit eof"));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Positioned write on the blocking pool. Completes before returning, so the
/// handle clone is released when this future resolves.
pub async fn write_at_blocking(file: Arc<File>, buf: Vec<u8>, offset: u64) -> UpdateResult<()> {
    tokio::task::spawn_blocking(move || write_all_at(&file, &buf, offset))
        .await
        .map_err(|e| UpdateError::Internal(format!("write task failed: {}", e)))?
        .map_err(|e| UpdateError::IoError(format!("write at offset {} failed: {}", offset, e)))
}

pub async fn read_at_blocking(file: Arc<File>, len: usize, offset: u64) -> UpdateResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        read_exact_at(&file, &mut buf, offset).map(|_| buf)
    })
    .await
    .map_err(|e| UpdateError::Internal(format!("read task failed: {}", e)))?
    .map_err(|e| UpdateError::IoError(format!("read at offset {} failed: {}", offset, e)))
}
