#![forbid(unsafe_code)]
//! Asynchronous 9P2000/9P2000.u protocol library for Rust.
//!
//! This crate provides a tokio-based implementation of both sides of the
//! 9P2000 file protocol: a client that multiplexes concurrent requests
//! over one connection, and a server that dispatches requests to a
//! filesystem back-end of your making. The ".u" extension (numeric
//! uid/gid, errno on errors, special-file descriptions) is negotiated
//! per connection and handled throughout.
//!
//! # Overview
//!
//! The 9P protocol was originally developed for the Plan 9 distributed
//! operating system: a compact, synchronous request/response protocol in
//! which a client manipulates remote file trees through stateful handles
//! called fids. Every request carries a 16-bit tag; replies may arrive
//! in any order and the tag is the sole correlator.
//!
//! # Serving a filesystem
//!
//! 1. Define a type for your per-fid state (or use `()` for stateless fids)
//! 2. Implement the [`srv::Filesystem`] trait for your filesystem type
//! 3. Start the server with [`srv::srv_async`] or [`srv::Srv`]
//!
//! ```no_run
//! use styx::{srv::{Filesystem, FId, srv_async}, FCall, QId, QIdType, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type FId = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &FId<Self::FId>,
//!         _afid: Option<&FId<Self::FId>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _nuname: u32,
//!     ) -> Result<FCall> {
//!         Ok(FCall::RAttach {
//!             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
//!         })
//!     }
//!
//!     // Implement other required methods...
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Talking to a server
//!
//! [`clnt::Clnt`] owns one connection. Many tasks may clone it and issue
//! requests concurrently; each caller blocks only on its own reply.
//!
//! ```no_run
//! use styx::clnt::Clnt;
//!
//! # async fn demo() -> styx::Result<()> {
//! let clnt = Clnt::mount("tcp!127.0.0.1!564", "/", 8192).await?;
//! let data = clnt.fopen("some/file", styx::om::READ).await?;
//! let bytes = clnt.read(&data, 0, 4096).await?;
//! clnt.clunk(data).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Message Flow
//!
//! 1. **Version Negotiation**: client sends `Tversion`, the server
//!    answers with the msize and dialect both sides can live with
//! 2. **Authentication** (optional): `Tauth`/`Rauth` exchange
//! 3. **Attach**: the client binds a fid to a file tree root
//! 4. **Operations**: walk, open, read, write, stat, wstat, remove
//! 5. **Cleanup**: fids are released with `Tclunk`
//!
//! # Fid Management
//!
//! A fid is a 32-bit handle chosen by the client to reference a file or
//! directory, with an attached user identity and open state.
//!
//! **Important invariants:**
//! - The fid namespace is per-connection
//! - Fids persist across operations until explicitly clunked
//! - Walking binds a new fid; the old one remains valid
//! - The server refuses operations on unknown or wrong-state fids
//! - `NOFID` is reserved, as `NOTAG` is for tags
//!
//! # Error Handling
//!
//! Everything returns [`error::Error`]. Transport and protocol failures
//! latch on their connection and fan out to every waiter; Rerror from
//! the peer, argument and fid-state problems stay with the call that
//! caused them. Servers answer back-end errors as `Rerror` with the
//! ".u" errno when the dialect carries one.
//!
//! # Transport
//!
//! Any reliable bidirectional byte stream works. Dial strings name the
//! usual two:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix domain sockets**: `"unix!path"`
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies
//! on Rust's type system for memory safety.
pub mod clnt;
pub mod error;
pub mod fcall;
pub mod pool;
pub mod serialize;
pub mod srv;
pub mod user;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::user::{OsUsers, StaticUser, User};
pub use crate::utils::Result;
