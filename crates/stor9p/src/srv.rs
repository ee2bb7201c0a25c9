//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! One call to [`serve`] runs one session: frames are decoded in order, each
//! request is handled on its own task and responses are written through a
//! single framed sink so they never interleave. Response order follows
//! completion order, not request order.

use {
    crate::{
        backend::{Fid, Srv},
        error::Error,
        fcall::*,
        frame::{FrameCodec, encode_msg},
        res,
        utils::Result,
    },
    bytes::Bytes,
    futures::sink::SinkExt,
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex as StdMutex, MutexGuard, PoisonError,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{Mutex, Semaphore},
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::{
        codec::{BytesCodec, FramedRead, FramedWrite},
        sync::CancellationToken,
    },
};

/// Per-session limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest frame the server accepts and offers in `RVersion`
    pub msize: u32,
    /// Requests handled concurrently before decoding pauses
    pub max_in_flight: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            msize: 64 * 1024 + IOHDRSZ,
            max_in_flight: 256,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FidState {
    Unbound,
    /// An open or create is in progress
    Opening,
    Open { mode: OpenMode, typ: QIdType },
}

struct FidEntry<F> {
    fid: F,
    auth: bool,
    state: StdMutex<FidState>,
}

impl<F> FidEntry<F> {
    fn new(fid: F, auth: bool) -> FidEntry<F> {
        FidEntry {
            fid,
            auth,
            state: StdMutex::new(FidState::Unbound),
        }
    }

    fn state(&self) -> MutexGuard<'_, FidState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Unbound → Opening, or fail if the fid is already (being) opened.
    fn begin_open(&self) -> Result<OpenGuard<'_, F>> {
        let mut state = self.state();
        if *state != FidState::Unbound {
            return res!(Error::BadFidState);
        }
        *state = FidState::Opening;
        Ok(OpenGuard {
            entry: self,
            done: false,
        })
    }
}

/// Reverts an unfinished open to Unbound when dropped.
struct OpenGuard<'a, F> {
    entry: &'a FidEntry<F>,
    done: bool,
}

impl<F> OpenGuard<'_, F> {
    fn commit(mut self, mode: OpenMode, typ: QIdType) {
        *self.entry.state() = FidState::Open { mode, typ };
        self.done = true;
    }
}

impl<F> Drop for OpenGuard<'_, F> {
    fn drop(&mut self) {
        if !self.done {
            *self.entry.state() = FidState::Unbound;
        }
    }
}

enum Slot<F> {
    /// Claimed by a request whose backend call has not finished
    Reserved,
    Bound(Arc<FidEntry<F>>),
}

/// The fids of one session.
///
/// The lock only guards the map and is never held across an await.
struct FidTable<F> {
    slots: StdMutex<HashMap<u32, Slot<F>>>,
}

impl<F> FidTable<F> {
    fn new() -> FidTable<F> {
        FidTable {
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u32, Slot<F>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, fid: u32) -> Result<Arc<FidEntry<F>>> {
        match self.slots().get(&fid) {
            Some(Slot::Bound(entry)) => Ok(entry.clone()),
            _ => res!(Error::UnknownFid),
        }
    }

    fn reserve(&self, fid: u32) -> Result<Reservation<'_, F>> {
        let mut slots = self.slots();
        if slots.contains_key(&fid) {
            return res!(Error::DuplicateFid);
        }
        slots.insert(fid, Slot::Reserved);
        Ok(Reservation {
            table: self,
            fid,
            bound: false,
        })
    }

    /// Swap the entry of `fid` for `new` if it is still `old`.
    fn replace(&self, fid: u32, old: &Arc<FidEntry<F>>, new: FidEntry<F>) -> Result<()> {
        match self.slots().get_mut(&fid) {
            Some(Slot::Bound(cur)) if Arc::ptr_eq(cur, old) => {
                *cur = Arc::new(new);
                Ok(())
            }
            _ => res!(Error::UnknownFid),
        }
    }

    fn remove(&self, fid: u32) -> Result<Arc<FidEntry<F>>> {
        let mut slots = self.slots();
        match slots.get(&fid) {
            Some(Slot::Bound(_)) => match slots.remove(&fid) {
                Some(Slot::Bound(entry)) => Ok(entry),
                _ => res!(Error::UnknownFid),
            },
            _ => res!(Error::UnknownFid),
        }
    }

    fn drain(&self) -> Vec<Arc<FidEntry<F>>> {
        self.slots()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Bound(entry) => Some(entry),
                Slot::Reserved => None,
            })
            .collect()
    }
}

/// A claimed fid number, released on drop unless bound.
struct Reservation<'a, F> {
    table: &'a FidTable<F>,
    fid: u32,
    bound: bool,
}

impl<F> Reservation<'_, F> {
    fn bind(mut self, entry: FidEntry<F>) {
        self.table
            .slots()
            .insert(self.fid, Slot::Bound(Arc::new(entry)));
        self.bound = true;
    }
}

impl<F> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.bound {
            return;
        }
        let mut slots = self.table.slots();
        if let Some(Slot::Reserved) = slots.get(&self.fid) {
            slots.remove(&self.fid);
        }
    }
}

fn is_supported_version(version: &str) -> bool {
    version == P92000
        || version
            .strip_prefix(P92000)
            .is_some_and(|dialect| dialect.starts_with('.'))
}

struct Session<S: Srv> {
    srv: Arc<S>,
    fids: FidTable<S::Fid>,
    max_msize: u32,
    msize: AtomicU32,
}

impl<S: Srv> Session<S> {
    fn new(srv: Arc<S>, config: &Config) -> Session<S> {
        Session {
            srv,
            fids: FidTable::new(),
            max_msize: config.msize,
            msize: AtomicU32::new(config.msize),
        }
    }

    #[rustfmt::skip]
    async fn dispatch(&self, body: FCall) -> Result<FCall> {
        use crate::FCall::*;

        match body {
            TVersion { msize, version }                 => self.version(msize, &version).await,
            TAuth { afid, uname, aname }                => self.auth(afid, &uname, &aname).await,
            TAttach { fid, afid, uname, aname }         => self.attach(fid, afid, &uname, &aname).await,
            TFlush { .. }                               => Ok(RFlush),
            TWalk { fid, newfid, wnames }               => self.walk(fid, newfid, &wnames).await,
            TOpen { fid, mode }                         => self.open(fid, mode).await,
            TCreate { fid, name, perm, mode }           => self.create(fid, &name, perm, mode).await,
            TRead { fid, offset, count }                => self.read(fid, offset, count).await,
            TWrite { fid, offset, data }                => self.write(fid, offset, &data.0).await,
            TClunk { fid }                              => self.clunk(fid).await,
            TRemove { fid }                             => self.remove(fid).await,
            TStat { fid }                               => self.stat(fid).await,
            TWStat { fid, stat }                        => self.wstat(fid, &stat).await,
            _                                           => res!(Error::UnknownMessage),
        }
    }

    async fn version(&self, msize: u32, version: &str) -> Result<FCall> {
        let msize = msize.min(self.max_msize);
        if !is_supported_version(version) {
            return Ok(FCall::RVersion {
                msize,
                version: VERSION_UNKNOWN.to_owned(),
            });
        }

        self.msize.store(msize, Ordering::SeqCst);
        self.clunk_all().await;

        Ok(FCall::RVersion {
            msize,
            version: P92000.to_owned(),
        })
    }

    async fn auth(&self, afid: u32, uname: &str, aname: &str) -> Result<FCall> {
        let reservation = self.fids.reserve(afid)?;
        let (fid, aqid) = self.srv.auth(uname, aname).await?;
        reservation.bind(FidEntry::new(fid, true));
        Ok(FCall::RAuth { aqid })
    }

    async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<FCall> {
        let auth = match afid {
            NOFID => None,
            afid => {
                let entry = self.fids.get(afid)?;
                if !entry.auth {
                    return res!(Error::BadFidState);
                }
                Some(entry)
            }
        };

        let reservation = self.fids.reserve(fid)?;
        let (root, qid) = self
            .srv
            .attach(auth.as_ref().map(|entry| &entry.fid), uname, aname)
            .await?;
        reservation.bind(FidEntry::new(root, false));
        Ok(FCall::RAttach { qid })
    }

    async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        if wnames.len() > MAXWELEM {
            return res!(Error::TooManyWalkNames);
        }

        let entry = self.fids.get(fid)?;
        if entry.auth || *entry.state() != FidState::Unbound {
            return res!(Error::BadFidState);
        }

        let reservation = match newfid == fid {
            true => None,
            false => Some(self.fids.reserve(newfid)?),
        };

        let (target, wqids) = entry.fid.walk(wnames).await?;
        if wqids.is_empty() && !wnames.is_empty() {
            return res!(Error::NotFound);
        }

        if wqids.len() == wnames.len() {
            let target = FidEntry::new(target, false);
            match reservation {
                Some(reservation) => reservation.bind(target),
                None => self.fids.replace(fid, &entry, target)?,
            }
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn open(&self, fid: u32, mode: u8) -> Result<FCall> {
        let entry = self.fids.get(fid)?;
        let mode = OpenMode::from_bits(mode)?;

        let guard = entry.begin_open()?;
        let (qid, iounit) = entry.fid.open(mode).await?;
        guard.commit(mode, qid.typ);

        Ok(FCall::ROpen { qid, iounit })
    }

    async fn create(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<FCall> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return res!(Error::IllegalName);
        }

        let entry = self.fids.get(fid)?;
        let mode = OpenMode::from_bits(mode)?;

        let guard = entry.begin_open()?;
        let (qid, iounit) = entry.fid.create(name, perm, mode).await?;
        guard.commit(mode, qid.typ);

        Ok(FCall::RCreate { qid, iounit })
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let entry = self.fids.get(fid)?;
        if !entry.auth {
            match *entry.state() {
                FidState::Open { mode, .. } if mode.is_readable() => {}
                FidState::Open { .. } => return res!(Error::PermissionDenied),
                _ => return res!(Error::BadFidState),
            }
        }

        let max = self.msize.load(Ordering::SeqCst).saturating_sub(IOHDRSZ);
        let mut buf = vec![0u8; count.min(max) as usize];
        let n = entry.fid.read_at(&mut buf, offset).await?;
        buf.truncate(n);

        Ok(FCall::RRead { data: Data(buf) })
    }

    async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<FCall> {
        let entry = self.fids.get(fid)?;
        if !entry.auth {
            match *entry.state() {
                FidState::Open { mode, .. } if !mode.is_writable() => {
                    return res!(Error::PermissionDenied);
                }
                FidState::Open { typ, .. } if typ.contains(QIdType::DIR) => {
                    return res!(Error::NoWrite);
                }
                FidState::Open { .. } => {}
                _ => return res!(Error::BadFidState),
            }
        }

        let count = entry.fid.write_at(data, offset).await?;
        Ok(FCall::RWrite {
            count: count as u32,
        })
    }

    async fn clunk(&self, fid: u32) -> Result<FCall> {
        let entry = self.fids.remove(fid)?;
        entry.fid.close().await?;
        Ok(FCall::RClunk)
    }

    async fn remove(&self, fid: u32) -> Result<FCall> {
        let entry = self.fids.remove(fid)?;
        let removed = entry.fid.remove().await;
        let closed = entry.fid.close().await;
        removed?;
        closed?;
        Ok(FCall::RRemove)
    }

    async fn stat(&self, fid: u32) -> Result<FCall> {
        let entry = self.fids.get(fid)?;
        Ok(FCall::RStat {
            stat: entry.fid.stat().await?,
        })
    }

    async fn wstat(&self, fid: u32, stat: &Dir) -> Result<FCall> {
        let entry = self.fids.get(fid)?;
        entry.fid.wstat(stat).await?;
        Ok(FCall::RWStat)
    }

    /// Release every fid, ignoring backend failures.
    async fn clunk_all(&self) {
        for entry in self.fids.drain() {
            if let Err(e) = entry.fid.close().await {
                warn!("Failed to close fid: {}", e);
            }
        }
    }
}

type Writer<W> = Arc<Mutex<FramedWrite<W, BytesCodec>>>;

/// Send one response unless the transport already failed.
async fn respond<W>(writer: &Writer<W>, cancel: &CancellationToken, msg: &Msg)
where
    W: AsyncWrite + Send + Unpin,
{
    let frame: Bytes = match encode_msg(msg) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to serialize response for tag {}: {}", msg.tag, e);
            let fallback = Msg {
                tag: msg.tag,
                body: FCall::error(&e),
            };
            match encode_msg(&fallback) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };

    let mut framedwrite = writer.lock().await;
    if cancel.is_cancelled() {
        return;
    }
    if let Err(e) = framedwrite.send(frame).await {
        error!("Failed to send response for tag {}: {}", msg.tag, e);
        cancel.cancel();
        return;
    }
    debug!("\t→ {:?}", msg);
}

/// Run one session over `reader`/`writer` until the client goes away or a
/// fatal error occurs.
///
/// Handlers still running when decoding stops are awaited, then every fid
/// left in the table is closed.
pub async fn serve_with_config<S, R, W>(
    srv: Arc<S>,
    reader: R,
    writer: W,
    config: Config,
) -> Result<()>
where
    S: Srv,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let session = Arc::new(Session::new(srv, &config));
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let cancel = CancellationToken::new();
    let writer: Writer<W> = Arc::new(Mutex::new(FramedWrite::new(writer, BytesCodec::new())));
    let mut framedread = FramedRead::new(reader, FrameCodec::new(config.msize));
    let mut handlers = JoinSet::new();

    info!("session started, msize {}", config.msize);

    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = framedread.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                if matches!(e, Error::Io(_) | Error::TruncatedFrame) {
                    cancel.cancel();
                }
                break Err(e);
            }
            None => break Ok(()),
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            },
        };
        while handlers.try_join_next().is_some() {}

        let tag = frame.tag;
        let request = match frame.decode() {
            Ok(msg) => Ok(msg),
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => {
                warn!("Undecodable message type {} tag {}: {}", frame.typ, tag, e);
                Err(e)
            }
        };

        let session = session.clone();
        let writer = writer.clone();
        let cancel = cancel.clone();
        handlers.spawn(async move {
            let _permit = permit;

            let body = match request {
                Ok(msg) => {
                    debug!("\t← {:?}", msg);
                    let typ = MsgType::from(&msg.body);
                    session.dispatch(msg.body).await.unwrap_or_else(|e| {
                        error!("{:?}: Error: \"{}\": {:?}", typ, e, e);
                        FCall::error(&e)
                    })
                }
                Err(e) => FCall::error(&e),
            };

            respond(&writer, &cancel, &Msg { tag, body }).await;
        });
    };

    while let Some(res) = handlers.join_next().await {
        if let Err(e) = res {
            error!("Request handler failed: {}", e);
        }
    }
    session.clunk_all().await;

    match result {
        Ok(()) => info!("session finished"),
        Err(ref e) => error!("session aborted: {}", e),
    }
    result
}

/// Run one session over a duplex byte stream with the default [`Config`].
pub async fn serve<S, T>(srv: Arc<S>, stream: T) -> Result<()>
where
    S: Srv,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (readhalf, writehalf) = tokio::io::split(stream);
    serve_with_config(srv, readhalf, writehalf, Config::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions() {
        assert!(is_supported_version("9P2000"));
        assert!(is_supported_version("9P2000.u"));
        assert!(is_supported_version("9P2000.L"));
        assert!(!is_supported_version("9P2000L"));
        assert!(!is_supported_version("9P1999"));
        assert!(!is_supported_version(""));
    }

    #[test]
    fn reservations_are_exclusive() {
        let table: FidTable<&str> = FidTable::new();

        let first = table.reserve(1).unwrap();
        assert!(matches!(table.reserve(1), Err(Error::DuplicateFid)));
        assert!(matches!(table.get(1), Err(Error::UnknownFid)));
        assert!(matches!(table.remove(1), Err(Error::UnknownFid)));

        first.bind(FidEntry::new("root", false));
        assert_eq!(table.get(1).unwrap().fid, "root");
        assert!(matches!(table.reserve(1), Err(Error::DuplicateFid)));
    }

    #[test]
    fn dropped_reservations_are_released() {
        let table: FidTable<()> = FidTable::new();
        drop(table.reserve(7).unwrap());
        assert!(table.reserve(7).is_ok());
    }

    #[test]
    fn replace_checks_identity() {
        let table: FidTable<u8> = FidTable::new();
        table.reserve(0).unwrap().bind(FidEntry::new(1, false));
        let old = table.get(0).unwrap();

        table.replace(0, &old, FidEntry::new(2, false)).unwrap();
        assert_eq!(table.get(0).unwrap().fid, 2);

        // `old` is no longer the bound entry
        assert!(matches!(
            table.replace(0, &old, FidEntry::new(3, false)),
            Err(Error::UnknownFid)
        ));
    }

    #[test]
    fn open_happens_once() {
        let entry = FidEntry::new((), false);

        let guard = entry.begin_open().unwrap();
        assert!(matches!(entry.begin_open(), Err(Error::BadFidState)));
        drop(guard);

        let guard = entry.begin_open().unwrap();
        guard.commit(OpenMode::READ, QIdType::FILE);
        assert!(matches!(entry.begin_open(), Err(Error::BadFidState)));
        assert_eq!(
            *entry.state(),
            FidState::Open {
                mode: OpenMode::READ,
                typ: QIdType::FILE
            }
        );
    }

    #[test]
    fn drain_skips_reservations() {
        let table: FidTable<u8> = FidTable::new();
        table.reserve(0).unwrap().bind(FidEntry::new(0, false));
        let pending = table.reserve(1).unwrap();

        assert_eq!(table.drain().len(), 1);
        drop(pending);
        assert!(matches!(table.get(0), Err(Error::UnknownFid)));
    }
}
