//! Serving a hierarchical filesystem through the backend contract.
//!
//! A [`FileSystem`] addresses objects by slash-separated paths relative to
//! the export root `"."`. [`FsSrv`] and [`FsFid`] turn one into a
//! [`Srv`](crate::backend::Srv): each fid remembers a path, walks join and
//! clean paths lexically, and open binds either a file handle or a
//! [`DirReader`] to the fid.

use {
    crate::{
        backend::{Fid, Srv},
        dir::{DirReader, DirStream},
        error::Error,
        fcall::{Dir, OpenMode, QId, QIdType, dm},
        res,
        utils::Result,
    },
    async_trait::async_trait,
    std::sync::{Arc, OnceLock},
    tokio::sync::{Mutex, RwLock},
};

/// Owner reported when the filesystem does not know one.
pub const DEFAULT_USER: &str = "none";

/// Mode bits that encode the kind of object rather than its permissions.
const KIND_BITS: u32 = 0xff00_0000;

/// Backend-neutral description of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Last path element
    pub name: String,
    /// Kind and permission bits, see [`dm`]
    pub mode: u32,
    pub length: u64,
    pub atime: u32,
    pub mtime: u32,
    /// Identifier stable for the object's lifetime, such as an inode number
    pub id: u64,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub muid: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    pub fn qid(&self) -> QId {
        QId {
            typ: QIdType::from_mode(self.mode),
            version: (self.mtime as u64 ^ (self.length << 8)) as u32,
            path: self.id,
        }
    }

    pub fn to_dir(&self) -> Dir {
        let user = |u: &Option<String>| u.clone().unwrap_or_else(|| DEFAULT_USER.to_owned());
        Dir {
            typ: 0,
            dev: 0,
            qid: self.qid(),
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.length,
            name: match self.name.as_str() {
                "." => "/".to_owned(),
                name => name.to_owned(),
            },
            uid: user(&self.uid),
            gid: user(&self.gid),
            muid: user(&self.muid),
        }
    }
}

/// Lexically clean a slash-separated path relative to the export root.
///
/// Empty and `.` elements are dropped, `..` removes the previous element
/// and never climbs above the root. The root itself is `"."`.
pub fn clean_path(path: &str) -> String {
    let mut elems: Vec<&str> = Vec::new();
    for elem in path.split('/') {
        match elem {
            "" | "." => {}
            ".." => {
                elems.pop();
            }
            elem => elems.push(elem),
        }
    }

    if elems.is_empty() {
        ".".to_owned()
    } else {
        elems.join("/")
    }
}

/// Path of `name` inside the directory `dir`.
pub fn join_path(dir: &str, name: &str) -> String {
    clean_path(&format!("{}/{}", dir, name))
}

/// Split a cleaned path into its parent and last element.
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => (".", path),
    }
}

fn check_name(name: &str) -> Result<()> {
    match name {
        "" | "." | ".." => res!(Error::IllegalName),
        name if name.contains('/') => res!(Error::IllegalName),
        _ => Ok(()),
    }
}

/// An open file that supports reads and writes at arbitrary offsets.
#[async_trait]
pub trait RandomAccess: Send + Sync + 'static {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::NoWrite)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open file that can only be read or written front to back.
///
/// Wrap it in [`Sequential`] to serve it.
#[async_trait]
pub trait SeqFile: Send + 'static {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NoWrite)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct SeqState<F> {
    file: F,
    read_offset: u64,
    write_offset: u64,
}

/// Serves a [`SeqFile`] as [`RandomAccess`] as long as reads and writes
/// each continue where the previous one stopped.
pub struct Sequential<F> {
    state: Mutex<SeqState<F>>,
}

impl<F: SeqFile> Sequential<F> {
    pub fn new(file: F) -> Sequential<F> {
        Sequential {
            state: Mutex::new(SeqState {
                file,
                read_offset: 0,
                write_offset: 0,
            }),
        }
    }
}

#[async_trait]
impl<F: SeqFile> RandomAccess for Sequential<F> {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock().await;
        if offset != state.read_offset {
            return res!(Error::BadOffset);
        }

        let mut n = 0;
        while n < buf.len() {
            match state.file.read(&mut buf[n..]).await? {
                0 => break,
                count => n += count,
            }
        }

        state.read_offset += n as u64;
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock().await;
        if offset != state.write_offset {
            return res!(Error::BadOffset);
        }

        let mut n = 0;
        while n < buf.len() {
            match state.file.write(&buf[n..]).await? {
                0 => break,
                count => n += count,
            }
        }

        state.write_offset += n as u64;
        Ok(n)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.file.close().await
    }
}

/// A hierarchical store addressed by cleaned, root-relative paths.
///
/// Only lookup, open and listing are required; every mutation defaults to
/// the matching "prohibited" error.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    type File: RandomAccess;
    type Dir: DirStream;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Open a non-directory. `mode.truncate` asks for the file to be
    /// emptied first.
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File>;

    async fn open_dir(&self, path: &str) -> Result<Self::Dir>;

    /// Create and open a new regular file.
    async fn create(&self, _path: &str, _perm: u32, _mode: OpenMode) -> Result<Self::File> {
        Err(Error::NoCreate)
    }

    async fn mkdir(&self, _path: &str, _perm: u32) -> Result<()> {
        Err(Error::NoCreate)
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        Err(Error::NoRemove)
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::NoWstat)
    }

    /// Change the permission bits.
    async fn chmod(&self, _path: &str, _perm: u32) -> Result<()> {
        Err(Error::NoWstat)
    }

    async fn truncate(&self, _path: &str, _length: u64) -> Result<()> {
        Err(Error::NoWstat)
    }

    async fn set_mtime(&self, _path: &str, _mtime: u32) -> Result<()> {
        Err(Error::NoWstat)
    }
}

/// `Srv` over a [`FileSystem`]. No authentication; `aname` selects the
/// subtree to attach to, the whole export when empty.
pub struct FsSrv<F> {
    fs: Arc<F>,
}

impl<F: FileSystem> FsSrv<F> {
    pub fn new(fs: F) -> FsSrv<F> {
        FsSrv { fs: Arc::new(fs) }
    }
}

#[async_trait]
impl<F: FileSystem> Srv for FsSrv<F> {
    type Fid = FsFid<F>;

    async fn attach(
        &self,
        _afid: Option<&FsFid<F>>,
        _uname: &str,
        aname: &str,
    ) -> Result<(FsFid<F>, QId)> {
        let path = clean_path(aname);
        let info = self.fs.stat(&path).await?;
        let root: Arc<str> = Arc::from(path.as_str());
        Ok((FsFid::new(self.fs.clone(), root, path), info.qid()))
    }
}

enum Handle<F: FileSystem> {
    File(F::File),
    Dir(DirReader<F::Dir>),
}

/// A fid on a [`FileSystem`]: a path plus, once opened, a handle.
///
/// `root` is the path the fid's tree was attached at; walks never leave it.
pub struct FsFid<F: FileSystem> {
    fs: Arc<F>,
    root: Arc<str>,
    path: RwLock<String>,
    handle: OnceLock<Handle<F>>,
}

impl<F: FileSystem> FsFid<F> {
    fn new(fs: Arc<F>, root: Arc<str>, path: String) -> FsFid<F> {
        FsFid {
            fs,
            root,
            path: RwLock::new(path),
            handle: OnceLock::new(),
        }
    }

    fn sibling(&self, path: String) -> FsFid<F> {
        FsFid::new(self.fs.clone(), self.root.clone(), path)
    }

    /// Path of walking `name` from `path`; `..` at the attach root stays put.
    fn step(&self, path: &str, name: &str) -> String {
        match name {
            ".." if path == &*self.root => path.to_owned(),
            name => join_path(path, name),
        }
    }

    /// Current path of the object relative to the export root.
    pub async fn path(&self) -> String {
        self.path.read().await.clone()
    }

    fn bind(&self, handle: Handle<F>) -> Result<()> {
        self.handle.set(handle).map_err(|_| Error::BadFidState)
    }

    async fn open_dir(&self, path: &str, mode: OpenMode) -> Result<Handle<F>> {
        if mode.is_writable() || mode.truncate {
            return res!(Error::PermissionDenied);
        }
        Ok(Handle::Dir(DirReader::new(self.fs.open_dir(path).await?)))
    }
}

#[async_trait]
impl<F: FileSystem> Fid for FsFid<F> {
    async fn walk(&self, names: &[String]) -> Result<(Self, Vec<QId>)> {
        let mut path = self.path().await;
        if names.is_empty() {
            return Ok((self.sibling(path), Vec::new()));
        }

        if !self.fs.stat(&path).await?.is_dir() {
            return res!(Error::WalkNoDir);
        }

        let mut wqids = Vec::with_capacity(names.len());
        for name in names {
            if wqids.last().is_some_and(|qid: &QId| !qid.is_dir()) {
                break;
            }

            let next = self.step(&path, name);
            let info = match check_name_for_walk(name) {
                Ok(()) => self.fs.stat(&next).await,
                Err(e) => Err(e),
            };
            match info {
                Ok(info) => {
                    wqids.push(info.qid());
                    path = next;
                }
                Err(e) if wqids.is_empty() => return Err(e),
                Err(_) => break,
            }
        }

        Ok((self.sibling(path), wqids))
    }

    async fn open(&self, mode: OpenMode) -> Result<(QId, u32)> {
        let path = self.path().await;
        let mut info = self.fs.stat(&path).await?;

        let handle = if info.is_dir() {
            self.open_dir(&path, mode).await?
        } else {
            let file = self.fs.open(&path, mode).await?;
            if mode.truncate {
                info = self.fs.stat(&path).await?;
            }
            Handle::File(file)
        };

        self.bind(handle)?;
        Ok((info.qid(), 0))
    }

    async fn create(&self, name: &str, perm: u32, mode: OpenMode) -> Result<(QId, u32)> {
        check_name(name)?;

        let mut path = self.path.write().await;
        if !self.fs.stat(&path).await?.is_dir() {
            return res!(Error::PermissionDenied);
        }

        let child = join_path(&path, name);
        let handle = if perm & dm::DIR != 0 {
            if mode.is_writable() || mode.truncate {
                return res!(Error::PermissionDenied);
            }
            self.fs.mkdir(&child, perm).await?;
            self.open_dir(&child, mode).await?
        } else {
            Handle::File(self.fs.create(&child, perm, mode).await?)
        };

        let info = self.fs.stat(&child).await?;
        self.bind(handle)?;
        *path = child;
        Ok((info.qid(), 0))
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self.handle.get() {
            Some(Handle::File(file)) => file.read_at(buf, offset).await,
            Some(Handle::Dir(dir)) => dir.read_at(buf, offset).await,
            None => res!(Error::BadFidState),
        }
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        match self.handle.get() {
            Some(Handle::File(file)) => file.write_at(buf, offset).await,
            Some(Handle::Dir(_)) => res!(Error::NoWrite),
            None => res!(Error::BadFidState),
        }
    }

    async fn close(&self) -> Result<()> {
        match self.handle.get() {
            Some(Handle::File(file)) => file.close().await,
            _ => Ok(()),
        }
    }

    async fn remove(&self) -> Result<()> {
        let path = self.path().await;
        if path == "." || path == &*self.root {
            return res!(Error::PermissionDenied);
        }
        self.fs.remove(&path).await
    }

    async fn stat(&self) -> Result<Dir> {
        Ok(self.fs.stat(&self.path().await).await?.to_dir())
    }

    /// Every check runs before the first change. A backend failure part
    /// way through leaves the earlier changes applied.
    async fn wstat(&self, dir: &Dir) -> Result<()> {
        let mut path = self.path.write().await;
        let cur = self.fs.stat(&path).await?;
        let qid = cur.qid();

        // Refuse the whole request before touching anything.
        if !dir.uid.is_empty() || !dir.gid.is_empty() || !dir.muid.is_empty() {
            return res!(Error::NoWstat);
        }
        if (dir.typ != !0 && dir.typ != 0)
            || (dir.dev != !0 && dir.dev != 0)
            || (dir.qid.path != !0 && dir.qid.path != qid.path)
            || (dir.atime != !0 && dir.atime != cur.atime)
        {
            return res!(Error::NoWstat);
        }
        if dir.mode != !0 && (dir.mode ^ cur.mode) & KIND_BITS != 0 {
            return res!(Error::PermissionDenied);
        }
        if dir.length != !0 && cur.is_dir() && dir.length != 0 {
            return res!(Error::PermissionDenied);
        }
        let target = match dir.name.as_str() {
            "" => None,
            name if name == cur.name => None,
            name => {
                check_name(name)?;
                if *path == "." || *path == *self.root {
                    return res!(Error::PermissionDenied);
                }
                let (parent, _) = split_path(&path);
                Some(join_path(parent, name))
            }
        };
        if let Some(target) = &target {
            match self.fs.stat(target).await {
                Ok(_) => return res!(Error::Exists),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        if dir.length != !0 && !cur.is_dir() && dir.length != cur.length {
            self.fs.truncate(&path, dir.length).await?;
        }
        if dir.mode != !0 && dir.mode != cur.mode {
            self.fs.chmod(&path, dir.mode & !KIND_BITS).await?;
        }
        if dir.mtime != !0 && dir.mtime != cur.mtime {
            self.fs.set_mtime(&path, dir.mtime).await?;
        }
        if let Some(target) = target {
            self.fs.rename(&path, &target).await?;
            *path = target;
        }

        Ok(())
    }
}

/// Walk elements are single names, but `..` and `.` are allowed.
fn check_name_for_walk(name: &str) -> Result<()> {
    match name {
        "." | ".." => Ok(()),
        name => check_name(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_stays_under_the_root() {
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("/"), ".");
        assert_eq!(clean_path("a//b/./c/"), "a/b/c");
        assert_eq!(clean_path("a/../b"), "b");
        assert_eq!(clean_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(join_path(".", ".."), ".");
        assert_eq!(join_path("usr/glenda", ".."), "usr");
    }

    #[test]
    fn split_parent() {
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(split_path("c"), (".", "c"));
    }

    #[test]
    fn names_are_single_elements() {
        assert!(check_name("lib").is_ok());
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(check_name(bad), Err(Error::IllegalName)));
        }
        assert!(check_name_for_walk("..").is_ok());
        assert!(check_name_for_walk("a/b").is_err());
    }

    #[test]
    fn qid_derivation() {
        let info = FileInfo {
            name: "notes".into(),
            mode: dm::APPEND | 0o644,
            length: 3,
            mtime: 0x1000,
            id: 99,
            ..Default::default()
        };
        let qid = info.qid();
        assert_eq!(qid.typ, QIdType::APPEND);
        assert_eq!(qid.version, 0x1000 ^ 0x300);
        assert_eq!(qid.path, 99);
        assert_eq!(info.qid(), qid);
    }

    #[test]
    fn dir_derivation() {
        let root = FileInfo {
            name: ".".into(),
            mode: dm::DIR | 0o755,
            uid: Some("glenda".into()),
            id: 1,
            ..Default::default()
        };
        let dir = root.to_dir();
        assert_eq!(dir.name, "/");
        assert_eq!(dir.uid, "glenda");
        assert_eq!(dir.gid, DEFAULT_USER);
        assert_eq!(dir.muid, DEFAULT_USER);
        assert_eq!((dir.typ, dir.dev), (0, 0));
        assert!(dir.qid.is_dir());
        assert_eq!(dir.qid, root.qid());
    }

    struct Chunks {
        data: Vec<u8>,
        pos: usize,
        written: Vec<u8>,
    }

    #[async_trait]
    impl SeqFile for Chunks {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            // hand out at most 3 bytes at a time
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn sequential_reads_fill_the_buffer() {
        let file = Sequential::new(Chunks {
            data: b"hello, world".to_vec(),
            pos: 0,
            written: Vec::new(),
        });

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 0).await.unwrap(), 8);
        assert_eq!(&buf, b"hello, w");
        assert_eq!(file.read_at(&mut buf, 8).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"orld");
        assert_eq!(file.read_at(&mut buf, 12).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sequential_rejects_seeks() {
        let file = Sequential::new(Chunks {
            data: b"abcdef".to_vec(),
            pos: 0,
            written: Vec::new(),
        });

        let mut buf = [0u8; 2];
        assert!(matches!(
            file.read_at(&mut buf, 2).await,
            Err(Error::BadOffset)
        ));
        file.read_at(&mut buf, 0).await.unwrap();
        assert!(matches!(
            file.read_at(&mut buf, 0).await,
            Err(Error::BadOffset)
        ));

        assert_eq!(file.write_at(b"xy", 0).await.unwrap(), 2);
        assert!(matches!(
            file.write_at(b"z", 0).await,
            Err(Error::BadOffset)
        ));
        assert_eq!(file.write_at(b"z", 2).await.unwrap(), 1);
        assert_eq!(file.state.lock().await.file.written, b"xyz");
    }
}
