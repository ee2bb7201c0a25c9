#![forbid(unsafe_code)]
//! Asynchronous 9P2000 file server library for Rust.
//!
//! This crate provides a tokio-based implementation of the server side of the
//! 9P2000 protocol. Any backing store can be exposed to 9P clients by
//! implementing a small capability contract; hierarchical stores get a ready
//! made adapter.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed operating
//! system. A client opens a byte stream, negotiates a version and message size,
//! attaches to a tree and then manipulates numeric handles ("fids") with walk,
//! open, create, read, write, stat and remove requests.
//!
//! # Getting Started
//!
//! There are two ways to plug in a store:
//!
//! 1. Implement [`backend::Srv`] and [`backend::Fid`] directly, for synthetic
//!    namespaces where you want full control over every request.
//! 2. Implement [`fs::FileSystem`] for anything that looks like a tree of
//!    files addressed by path, and serve it through [`fs::FsSrv`].
//!
//! Then hand a connected byte stream to [`srv::serve`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stor9p::{
//!     dir::Listing,
//!     fs::{FileInfo, FileSystem, FsSrv, RandomAccess},
//!     srv::serve,
//!     Error, OpenMode, Result, dm,
//! };
//! use async_trait::async_trait;
//!
//! /// A single empty directory.
//! struct Empty;
//! struct NoFile;
//!
//! #[async_trait]
//! impl RandomAccess for NoFile {
//!     async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
//!         Ok(0)
//!     }
//! }
//!
//! #[async_trait]
//! impl FileSystem for Empty {
//!     type File = NoFile;
//!     type Dir = Listing;
//!
//!     async fn stat(&self, path: &str) -> Result<FileInfo> {
//!         match path {
//!             "." => Ok(FileInfo { name: ".".into(), mode: dm::DIR | 0o555, ..Default::default() }),
//!             _ => Err(Error::NotFound),
//!         }
//!     }
//!
//!     async fn open(&self, _path: &str, _mode: OpenMode) -> Result<NoFile> {
//!         Err(Error::NotFound)
//!     }
//!
//!     async fn open_dir(&self, _path: &str) -> Result<Listing> {
//!         Ok(Listing::new(Ok(Vec::new())))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let srv = Arc::new(FsSrv::new(Empty));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5640").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         tokio::spawn(serve(srv.clone(), stream));
//!     }
//! }
//! ```
//!
//! # Fid Management
//!
//! The session owns the fid table; backends never see fid numbers. A fid
//! is created by attach, auth or walk, opened at most once with open or
//! create, and destroyed by clunk or remove. Requests naming a fid that is
//! not bound fail with "unknown fid" and leave the table untouched.
//!
//! # Error Handling
//!
//! Every [`Error`] except the frame-level ones is answered with an `RError`
//! carrying the request's tag and the error's `Display` text; the session
//! carries on. Malformed or truncated frames end the session.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod backend;
pub mod dir;
pub mod error;
pub mod fcall;
pub mod frame;
pub mod fs;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
