//! The capability contract a backing store implements to be served.
//!
//! A backend provides a [`Srv`], the entry point for `TAuth`/`TAttach`, and
//! a [`Fid`] type standing for one client handle. The session owns the fid
//! table and the per-fid state machine; a backend only answers questions
//! about the object a handle refers to.
//!
//! Every method takes `&self`: several requests on the same fid may be in
//! flight at once, so implementors keep mutable state behind their own
//! locks.

use crate::{
    error::Error,
    fcall::{Dir, OpenMode, QId},
    utils::Result,
};
use async_trait::async_trait;

/// Entry point of a backend.
///
/// # Example
/// ```no_run
/// use stor9p::{backend::{Fid, Srv}, Dir, OpenMode, QId, QIdType, Result};
/// use async_trait::async_trait;
///
/// struct Empty;
/// struct Root;
///
/// fn root_qid() -> QId {
///     QId { typ: QIdType::DIR, version: 0, path: 0 }
/// }
///
/// #[async_trait]
/// impl Fid for Root {
///     async fn walk(&self, _names: &[String]) -> Result<(Self, Vec<QId>)> {
///         Err(stor9p::Error::NotFound)
///     }
///     async fn open(&self, _mode: OpenMode) -> Result<(QId, u32)> {
///         Ok((root_qid(), 0))
///     }
///     async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
///         Ok(0)
///     }
///     async fn stat(&self) -> Result<Dir> {
///         Ok(Dir { qid: root_qid(), name: "/".into(), ..Default::default() })
///     }
/// }
///
/// #[async_trait]
/// impl Srv for Empty {
///     type Fid = Root;
///
///     async fn attach(&self, _afid: Option<&Root>, _uname: &str, _aname: &str)
///         -> Result<(Root, QId)>
///     {
///         Ok((Root, root_qid()))
///     }
/// }
/// ```
#[async_trait]
pub trait Srv: Send + Sync + 'static {
    type Fid: Fid;

    /// Start an authentication conversation on a new fid.
    ///
    /// The default reports that no authentication is needed and attach may
    /// be used directly.
    async fn auth(&self, _uname: &str, _aname: &str) -> Result<(Self::Fid, QId)> {
        Err(Error::NoAuthRequired)
    }

    /// Bind a new fid to the root of the tree named by `aname`.
    ///
    /// `afid` is the authentication fid the client presented, if any.
    async fn attach(
        &self,
        afid: Option<&Self::Fid>,
        uname: &str,
        aname: &str,
    ) -> Result<(Self::Fid, QId)>;
}

/// One client handle on a backend object.
#[async_trait]
pub trait Fid: Send + Sync + Sized + 'static {
    /// Descend through `names` starting at this object.
    ///
    /// Returns the handle for the last name resolved together with one qid
    /// per resolved name. Stopping early yields fewer qids than names; the
    /// first name failing is an error. With no names this clones the handle.
    async fn walk(&self, names: &[String]) -> Result<(Self, Vec<QId>)>;

    /// Prepare the object for I/O. Returns its qid and the preferred I/O
    /// unit, 0 meaning no preference.
    async fn open(&self, mode: OpenMode) -> Result<(QId, u32)>;

    /// Create `name` inside this directory and make this handle refer to
    /// the new object, opened with `mode`.
    async fn create(&self, _name: &str, _perm: u32, _mode: OpenMode) -> Result<(QId, u32)> {
        Err(Error::NoCreate)
    }

    /// Read at an absolute offset. Zero bytes means end of data.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::NoWrite)
    }

    /// Release whatever `open`/`create` acquired. Called once when the fid
    /// is clunked or removed.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Delete the object. `close` is called afterwards regardless of the
    /// outcome.
    async fn remove(&self) -> Result<()> {
        Err(Error::NoRemove)
    }

    async fn stat(&self) -> Result<Dir>;

    /// Apply the fields of `dir` that are not "don't touch".
    async fn wstat(&self, _dir: &Dir) -> Result<()> {
        Err(Error::NoWstat)
    }
}
