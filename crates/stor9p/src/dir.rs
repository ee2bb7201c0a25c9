//! Serving a directory listing as a byte stream of packed `Dir` records.

use {
    crate::{error::Error, fs::FileInfo, res, serialize::Encodable, utils::Result},
    async_trait::async_trait,
    std::collections::VecDeque,
    tokio::sync::Mutex,
};

/// Entries requested from a `DirStream` per refill.
const BATCH: isize = 64;

/// Incremental directory listing.
#[async_trait]
pub trait DirStream: Send + 'static {
    /// Return up to `n` entries if `n > 0`, or all remaining ones otherwise.
    ///
    /// At the end of the listing this yields an empty batch for `n <= 0`
    /// and `None` for `n > 0`.
    async fn read_dir(&mut self, n: isize) -> Result<Option<Vec<FileInfo>>>;
}

/// A `DirStream` over a listing fetched in one go.
///
/// A failed listing is remembered and reported by every read.
#[derive(Debug)]
pub struct Listing {
    entries: VecDeque<FileInfo>,
    error: Option<String>,
}

impl Listing {
    pub fn new(listing: Result<Vec<FileInfo>>) -> Listing {
        match listing {
            Ok(entries) => Listing {
                entries: entries.into(),
                error: None,
            },
            Err(e) => Listing {
                entries: VecDeque::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl DirStream for Listing {
    async fn read_dir(&mut self, n: isize) -> Result<Option<Vec<FileInfo>>> {
        if let Some(ref e) = self.error {
            return res!(Error::Backend(e.clone()));
        }

        if n <= 0 {
            return Ok(Some(self.entries.drain(..).collect()));
        }
        if self.entries.is_empty() {
            return Ok(None);
        }

        let n = (n as usize).min(self.entries.len());
        Ok(Some(self.entries.drain(..n).collect()))
    }
}

struct State<S> {
    stream: S,
    /// Encoded records not yet handed out
    pending: VecDeque<Vec<u8>>,
    /// Byte offset the next read must start at
    offset: u64,
    eof: bool,
    /// Listing failure hit after part of a read was already filled
    deferred: Option<Error>,
}

/// Reads a directory as consecutive `Dir` records.
///
/// Records are never split across reads. Each read must start where the
/// previous one ended.
pub struct DirReader<S> {
    state: Mutex<State<S>>,
}

impl<S: DirStream> DirReader<S> {
    pub fn new(stream: S) -> DirReader<S> {
        DirReader {
            state: Mutex::new(State {
                stream,
                pending: VecDeque::new(),
                offset: 0,
                eof: false,
                deferred: None,
            }),
        }
    }

    /// Fill `buf` with as many whole records as fit.
    ///
    /// Returns 0 at the end of the directory, and also when the next record
    /// alone is larger than `buf`; that record stays queued.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if offset != state.offset {
            return res!(Error::BadOffset);
        }
        if let Some(e) = state.deferred.take() {
            return Err(e);
        }

        let mut n = 0;
        loop {
            if state.pending.is_empty() {
                if state.eof {
                    break;
                }
                match state.stream.read_dir(BATCH).await {
                    Ok(Some(batch)) if !batch.is_empty() => {
                        for info in batch {
                            let mut record = Vec::new();
                            info.to_dir().encode(&mut record)?;
                            state.pending.push_back(record);
                        }
                    }
                    Ok(_) => state.eof = true,
                    Err(e) if n == 0 => return Err(e),
                    Err(e) => {
                        state.deferred = Some(e);
                        break;
                    }
                }
                continue;
            }

            let len = state.pending[0].len();
            if n + len > buf.len() {
                break;
            }
            if let Some(record) = state.pending.pop_front() {
                buf[n..n + len].copy_from_slice(&record);
                n += len;
            }
        }

        state.offset += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Dir, dm};
    use crate::serialize::Decodable;

    fn entries(count: usize) -> Vec<FileInfo> {
        (0..count)
            .map(|i| FileInfo {
                name: format!("entry-{}", "x".repeat(i % 7)),
                mode: if i % 3 == 0 { dm::DIR | 0o755 } else { 0o644 },
                length: i as u64 * 100,
                mtime: 1_700_000_000 + i as u32,
                id: i as u64 + 1,
                ..Default::default()
            })
            .collect()
    }

    fn packed(infos: &[FileInfo]) -> Vec<u8> {
        let mut out = Vec::new();
        for info in infos {
            info.to_dir().encode(&mut out).unwrap();
        }
        out
    }

    async fn drain<S: DirStream>(reader: &DirReader<S>, bufsize: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; bufsize];
        loop {
            let n = reader.read_at(&mut buf, out.len() as u64).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn listing_batches() {
        let mut listing = Listing::new(Ok(entries(5)));
        assert_eq!(listing.read_dir(2).await.unwrap().unwrap().len(), 2);
        assert_eq!(listing.read_dir(10).await.unwrap().unwrap().len(), 3);
        assert!(listing.read_dir(1).await.unwrap().is_none());
        assert!(listing.read_dir(0).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_error_sticks() {
        let mut listing = Listing::new(Err(Error::backend("no such dir")));
        for n in [-1, 0, 4] {
            match listing.read_dir(n).await {
                Err(Error::Backend(e)) => assert_eq!(e, "no such dir"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn chunking_does_not_change_the_stream() {
        let infos = entries(150);
        let whole = packed(&infos);
        let largest = infos.iter().map(|i| i.to_dir().size() + 2).max().unwrap();

        for bufsize in [largest, largest + 1, 3 * largest - 1, 4096, whole.len() + 10] {
            let reader = DirReader::new(Listing::new(Ok(infos.clone())));
            assert_eq!(drain(&reader, bufsize).await, whole, "bufsize {}", bufsize);
        }
    }

    #[tokio::test]
    async fn records_are_never_split() {
        let infos = entries(10);
        let reader = DirReader::new(Listing::new(Ok(infos.clone())));

        let first = infos[0].to_dir().size() + 2;
        let second = infos[1].to_dir().size() + 2;
        let mut buf = vec![0u8; first + second - 1];
        let n = reader.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, first);

        let dir: Dir = Decodable::decode(&mut &buf[..n]).unwrap();
        assert_eq!(dir, infos[0].to_dir());
    }

    #[tokio::test]
    async fn reads_must_continue_in_order() {
        let reader = DirReader::new(Listing::new(Ok(entries(4))));
        let mut buf = vec![0u8; 8192];
        let n = reader.read_at(&mut buf, 0).await.unwrap();
        assert!(n > 0);

        assert!(matches!(
            reader.read_at(&mut buf, 1).await,
            Err(Error::BadOffset)
        ));
        assert!(matches!(
            reader.read_at(&mut buf, 0).await,
            Err(Error::BadOffset)
        ));
        assert_eq!(reader.read_at(&mut buf, n as u64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_record_reads_as_nothing() {
        let reader = DirReader::new(Listing::new(Ok(entries(1))));
        let mut tiny = [0u8; 8];
        assert_eq!(reader.read_at(&mut tiny, 0).await.unwrap(), 0);

        let mut buf = vec![0u8; 512];
        assert!(reader.read_at(&mut buf, 0).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn failed_listing_surfaces_on_read() {
        let reader = DirReader::new(Listing::new(Err(Error::NotFound)));
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            reader.read_at(&mut buf, 0).await,
            Err(Error::Backend(_))
        ));
    }
}
