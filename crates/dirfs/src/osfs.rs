//! A `FileSystem` over a local directory.

use {
    crate::utils::file_info,
    async_trait::async_trait,
    filetime::FileTime,
    log::warn,
    std::{
        io::{self, SeekFrom},
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
    stor9p::{
        Access, Error, OpenMode, Result,
        dir::DirStream,
        dm,
        fs::{FileInfo, FileSystem, RandomAccess},
        io_err, res,
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::Mutex,
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

fn os_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound,
        io::ErrorKind::PermissionDenied => Error::PermissionDenied,
        _ => Error::Io(e),
    }
}

/// Unix permission bits for a `Dir.mode` permission word.
fn unix_perm(perm: u32) -> u32 {
    let mut mode = perm & dm::PERM;
    if perm & dm::SETUID != 0 {
        mode |= 0o4000;
    }
    if perm & dm::SETGID != 0 {
        mode |= 0o2000;
    }
    mode
}

fn open_options(mode: OpenMode) -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    match mode.access {
        Access::Read | Access::Exec => options.read(true),
        Access::Write => options.write(true),
        Access::ReadWrite => options.read(true).write(true),
    };
    options.truncate(mode.truncate && mode.is_writable());
    options
}

pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> OsFs {
        OsFs { root: root.into() }
    }

    fn real(&self, path: &str) -> PathBuf {
        match path {
            "." => self.root.clone(),
            path => self.root.join(path),
        }
    }
}

#[async_trait]
impl FileSystem for OsFs {
    type File = OsFile;
    type Dir = OsDir;

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let attr = fs::symlink_metadata(self.real(path)).await.map_err(os_err)?;
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        Ok(file_info(name, &attr))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<OsFile> {
        let file = open_options(mode)
            .open(self.real(path))
            .await
            .map_err(os_err)?;
        Ok(OsFile::new(file))
    }

    async fn open_dir(&self, path: &str) -> Result<OsDir> {
        let entries = fs::read_dir(self.real(path)).await.map_err(os_err)?;
        Ok(OsDir {
            entries: ReadDirStream::new(entries),
        })
    }

    async fn create(&self, path: &str, perm: u32, mode: OpenMode) -> Result<OsFile> {
        let mut options = open_options(mode);
        let file = options
            .create_new(true)
            .write(true)
            .mode(unix_perm(perm))
            .open(self.real(path))
            .await
            .map_err(os_err)?;
        Ok(OsFile::new(file))
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        fs::DirBuilder::new()
            .mode(unix_perm(perm))
            .create(self.real(path))
            .await
            .map_err(os_err)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let real = self.real(path);
        match fs::symlink_metadata(&real).await.map_err(os_err)? {
            ref attr if attr.is_dir() => fs::remove_dir(&real).await,
            _ => fs::remove_file(&real).await,
        }
        .map_err(os_err)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.real(from), self.real(to))
            .await
            .map_err(os_err)
    }

    async fn chmod(&self, path: &str, perm: u32) -> Result<()> {
        fs::set_permissions(self.real(path), PermissionsExt::from_mode(unix_perm(perm)))
            .await
            .map_err(os_err)
    }

    async fn truncate(&self, path: &str, length: u64) -> Result<()> {
        fs::OpenOptions::new()
            .write(true)
            .open(self.real(path))
            .await
            .map_err(os_err)?
            .set_len(length)
            .await
            .map_err(os_err)
    }

    async fn set_mtime(&self, path: &str, mtime: u32) -> Result<()> {
        let real = self.real(path);
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&real, FileTime::from_unix_time(mtime as i64, 0))
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
        .map_err(os_err)
    }
}

/// An open local file. Reads and writes seek first, so one handle is
/// used by one request at a time.
pub struct OsFile {
    file: Mutex<fs::File>,
}

impl OsFile {
    fn new(file: fs::File) -> OsFile {
        OsFile {
            file: Mutex::new(file),
        }
    }
}

#[async_trait]
impl RandomAccess for OsFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.read(buf).await?)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.file.lock().await.sync_all().await?)
    }
}

/// A directory listed incrementally from the OS.
pub struct OsDir {
    entries: ReadDirStream,
}

#[async_trait]
impl DirStream for OsDir {
    async fn read_dir(&mut self, n: isize) -> Result<Option<Vec<FileInfo>>> {
        let mut batch = Vec::new();
        while n <= 0 || batch.len() < n as usize {
            let Some(entry) = self.entries.next().await else {
                break;
            };
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // gone since the listing was read, or not searchable
            let attr = match entry.metadata().await {
                Ok(attr) => attr,
                Err(e) => {
                    warn!("Skipping directory entry {:?}: {}", name, e);
                    continue;
                }
            };
            batch.push(file_info(name, &attr));
        }

        if n > 0 && batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

/// Check that `path` can serve as an export root, creating it if missing.
pub async fn check_root(path: &Path) -> Result<()> {
    if !fs::try_exists(path).await? {
        fs::create_dir_all(path).await?;
    }
    if !fs::metadata(path).await?.is_dir() {
        return res!(io_err!(Other, "export root must be a directory"));
    }
    Ok(())
}
