//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u
//!
//! One dispatcher runs per accepted connection. It frames incoming
//! requests, enforces the fid and tag discipline of the protocol, routes
//! each request to the back-end [`Filesystem`] as an independent task,
//! and packs replies back onto the shared writer. Back-ends never see
//! the wire form.

use {
    crate::{
        error::{Error, errno},
        fcall::*,
        serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        collections::{HashMap, HashSet},
        path::{Path, PathBuf},
        sync::{
            Arc, Mutex as StdMutex,
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, WriteHalf},
        net::{TcpListener, UnixListener},
        sync::{Mutex, RwLock, watch},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// Connection knobs for a server.
#[derive(Clone, Debug)]
pub struct SrvConfig {
    /// Largest msize the server will grant in version negotiation.
    pub msize: u32,
    /// Whether the server is willing to speak the ".u" dialect.
    pub dotu: bool,
    /// Tracing switches, see [`DebugFlags`].
    pub debug: DebugFlags,
    /// Used when printing debug messages.
    pub id: String,
}

impl Default for SrvConfig {
    fn default() -> Self {
        SrvConfig {
            msize: MSIZE_DEFAULT,
            dotu: true,
            debug: DebugFlags::empty(),
            id: "styx".to_owned(),
        }
    }
}

/// Represents a fid of clients holding associated `Filesystem::FId`.
///
/// The identity fields are maintained by the dispatcher from the
/// replies the back-end returns; handlers read them and keep their own
/// per-fid state in `aux`.
#[derive(Debug)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    qid: Option<QId>,
    omode: Option<u8>,
    uname: String,
    nuname: u32,
    dotu: bool,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The server's identity for the file, once attached or walked.
    pub fn qid(&self) -> Option<QId> {
        self.qid
    }

    /// The user this fid attached as.
    pub fn uname(&self) -> &str {
        &self.uname
    }

    /// The numeric user id, [`NONUNAME`] outside ".u".
    pub fn nuname(&self) -> u32 {
        self.nuname
    }

    /// Whether this fid's connection speaks the ".u" dialect, for
    /// back-ends that pack dialect-sensitive data such as directory
    /// reads.
    pub fn dotu(&self) -> bool {
        self.dotu
    }
}

/// Filesystem server trait for implementing 9P2000/9P2000.u servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with
/// required fields.
///
/// The dispatcher validates fid state before a handler runs: an unknown
/// fid, a walk from an open fid, a read on an unopened fid and the like
/// are refused without the back-end ever seeing them. Handlers can
/// therefore assume their preconditions hold.
///
/// # Error Handling
/// Return [`Error::no`]/[`Error::remote`] to send an Rerror to the
/// client. The errno travels on ".u" connections only; the message
/// travels always.
///
/// # Example
/// ```no_run
/// use styx::{srv::{Filesystem, FId}, FCall, QId, QIdType, Result};
/// use async_trait::async_trait;
///
/// #[derive(Clone)]
/// struct HelloFs;
///
/// #[async_trait]
/// impl Filesystem for HelloFs {
///     type FId = ();
///
///     async fn rattach(
///         &self,
///         _fid: &FId<Self::FId>,
///         _afid: Option<&FId<Self::FId>>,
///         _uname: &str,
///         _aname: &str,
///         _nuname: u32,
///     ) -> Result<FCall> {
///         Ok(FCall::RAttach {
///             qid: QId { typ: QIdType::DIR, version: 0, path: 0 },
///         })
///     }
///
///     // Implement other required methods...
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid state such as the current path, open
    /// handle, or any other metadata needed to service requests on this
    /// fid.
    type FId: Send + Sync + Default + 'static;

    /// Establish an authentication fid (".u" auth handshake).
    ///
    /// The afid becomes readable and writable for the authentication
    /// exchange; a later attach presents it. Most filesystems keep the
    /// default, which tells the client no authentication is needed.
    async fn rauth(
        &self,
        _afid: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _nuname: u32,
    ) -> Result<FCall> {
        Err(Error::remote("no authentication required", errno::EINVAL))
    }

    /// Attach a fid to the root of the file tree `aname`.
    ///
    /// The first operation after version negotiation. Returns
    /// `FCall::RAttach` with the root qid.
    async fn rattach(
        &self,
        _fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _nuname: u32,
    ) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// A client abandoned the request it sent under `oldtag`.
    ///
    /// Purely a notification: the dispatcher suppresses the old reply
    /// and answers the flush itself.
    async fn rflush(&self, _oldtag: u16) -> Result<()> {
        Ok(())
    }

    /// Walk from `fid` through `wnames`, binding `newfid` on success.
    ///
    /// Reply with one qid per step actually walked. Zero names is a
    /// clone and replies with zero qids. Failing on the first step is an
    /// error; stopping later returns the qids walked so far, and the
    /// dispatcher leaves `newfid` unbound.
    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Open a walked, unopened fid. Returns `FCall::ROpen` with the qid
    /// and the advised iounit (0 lets the client pick).
    async fn ropen(&self, _fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Create `name` in the directory `fid` points at and open it.
    /// `ext` carries the ".u" special-file description.
    async fn rcreate(
        &self,
        _fid: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _ext: &str,
    ) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Read from an open fid. For directories the data must be whole
    /// packed stat records; [`dir_read_chunk`] does the slicing.
    async fn rread(&self, _fid: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Write to an open fid. Returns `FCall::RWrite` with the count
    /// actually taken.
    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Release per-fid resources. The dispatcher drops the fid whether
    /// or not this succeeds.
    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file the fid points at. The fid is released
    /// unconditionally afterwards, like clunk.
    async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// The metadata for the file the fid points at, as `FCall::RStat`.
    async fn rstat(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }

    /// Modify metadata. Fields at their sentinel values are to be left
    /// alone; an all-sentinel record is a sync request.
    async fn rwstat(&self, _fid: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(Error::no(errno::EPERM))
    }
}

/// Slice packed directory data (concatenated stat records) for a read.
///
/// Only whole records travel. The offset must be 0 or the end of a
/// previous read, and a count too small to carry the next record is
/// refused rather than truncated.
pub fn dir_read_chunk(packed: &[u8], offset: u64, count: u32) -> Result<&[u8]> {
    let record_end = |pos: usize| -> Result<usize> {
        if pos + 2 > packed.len() {
            return Err(Error::remote("truncated dir entry", errno::EIO));
        }
        let sz = u16::from_le_bytes([packed[pos], packed[pos + 1]]) as usize;
        let end = pos + 2 + sz;
        if end > packed.len() {
            return Err(Error::remote("truncated dir entry", errno::EIO));
        }
        Ok(end)
    };

    if offset >= packed.len() as u64 {
        return Ok(&[]);
    }
    let start = offset as usize;

    let mut pos = 0;
    while pos < start {
        pos = record_end(pos)?;
    }
    if pos != start {
        return Err(Error::remote("bad offset in directory read", errno::EINVAL));
    }

    let mut end = start;
    while end < packed.len() {
        let next = record_end(end)?;
        if (next - start) as u64 > count as u64 {
            break;
        }
        end = next;
    }

    if end == start {
        return Err(Error::remote(
            "too small read size for dir entry",
            errno::EINVAL,
        ));
    }
    Ok(&packed[start..end])
}

struct Conn<T> {
    msize: AtomicU32,
    dotu: AtomicBool,
    /// False until the first successful Tversion.
    ready: AtomicBool,
    fids: RwLock<HashMap<u32, FId<T>>>,
    tags: StdMutex<TagTable>,
    config: SrvConfig,
}

/// In-flight request bookkeeping.
///
/// A tag is freed the moment a Tflush abandons it, so the client may
/// reuse it while the abandoned handler is still running. Each request
/// therefore carries a generation: the handler's reply goes out only if
/// its generation still owns the tag, and a flushed generation is
/// remembered until its handler finally drains.
#[derive(Default)]
struct TagTable {
    live: HashMap<u16, u64>,
    suppressed: HashSet<u64>,
    next_gen: u64,
}

type SharedWriter<S> = Arc<Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>>;

fn rerror_of(e: &Error) -> FCall {
    let ename = match e {
        Error::Remote { ename, .. } => ename.clone(),
        other => other.to_string(),
    };
    FCall::RError {
        ename,
        errno: e.errno(),
    }
}

/// Pack and send one reply, unless a Tflush suppressed it.
///
/// `gen_id` is the request's generation from the in-flight table, `None`
/// for replies that never entered it (version negotiation, pre-version
/// errors). The suppression decision and the write are serialized on
/// the writer lock so a flush can never race its victim's reply.
async fn respond<T, S>(conn: &Conn<T>, writer: &SharedWriter<S>, tag: u16, gen_id: Option<u64>, body: FCall)
where
    S: AsyncRead + AsyncWrite,
{
    let body = if MsgType::from(&body).is_r() {
        body
    } else {
        error!("backend returned a T-message for tag {tag}");
        rerror_of(&Error::no(errno::EIO))
    };

    let msg = Msg { tag, body };
    let dotu = conn.dotu.load(Ordering::Relaxed);

    let mut w = writer.lock().await;
    if let Some(gen_id) = gen_id {
        let mut tags = conn.tags.lock().unwrap();
        if tags.suppressed.remove(&gen_id) {
            debug!("reply for tag {tag} suppressed by flush");
            return;
        }
        if tags.live.get(&tag) == Some(&gen_id) {
            tags.live.remove(&tag);
        }
    }

    utils::trace_fcall(conn.config.debug, &conn.config.id, '>', &msg);
    let mut buf = bytes::BytesMut::with_capacity(4096).writer();
    if let Err(e) = serialize::write_msg(&mut buf, &msg, dotu) {
        error!("failed to serialize response for tag {tag}: {e}");
        return;
    }
    if let Err(e) = w.send(buf.into_inner().freeze()).await {
        error!("failed to send response for tag {tag}: {e}");
    }
}

/// A Tflush either lets oldtag's reply go out before its own Rflush, or
/// suppresses it for good. Under the writer lock exactly one of the two
/// orders is observed, and oldtag is free for reuse the moment Rflush
/// goes out.
async fn handle_flush<Fs, S>(
    conn: &Conn<Fs::FId>,
    fs: &Fs,
    writer: &SharedWriter<S>,
    tag: u16,
    gen_id: u64,
    oldtag: u16,
) where
    Fs: Filesystem + Send + Sync,
    S: AsyncRead + AsyncWrite,
{
    let _ = fs.rflush(oldtag).await;

    let msg = Msg {
        tag,
        body: FCall::RFlush,
    };
    let dotu = conn.dotu.load(Ordering::Relaxed);

    let mut w = writer.lock().await;
    {
        let mut tags = conn.tags.lock().unwrap();
        if tags.suppressed.remove(&gen_id) {
            return;
        }
        if let Some(old_gen) = tags.live.remove(&oldtag) {
            tags.suppressed.insert(old_gen);
        }
        if tags.live.get(&tag) == Some(&gen_id) {
            tags.live.remove(&tag);
        }
    }

    utils::trace_fcall(conn.config.debug, &conn.config.id, '>', &msg);
    let mut buf = bytes::BytesMut::with_capacity(64).writer();
    if serialize::write_msg(&mut buf, &msg, dotu).is_ok() {
        if let Err(e) = w.send(buf.into_inner().freeze()).await {
            error!("failed to send Rflush for tag {tag}: {e}");
        }
    }
}

/// Negotiate msize and dialect. A repeated Tversion resets the
/// connection, clunking every fid.
async fn handle_version<Fs, S>(
    conn: &Conn<Fs::FId>,
    fs: &Fs,
    writer: &SharedWriter<S>,
    tag: u16,
    msize: u32,
    version: &str,
) where
    Fs: Filesystem + Send + Sync,
    S: AsyncRead + AsyncWrite,
{
    let old: Vec<FId<Fs::FId>> = {
        let mut fids = conn.fids.write().await;
        fids.drain().map(|(_, f)| f).collect()
    };
    for f in &old {
        let _ = fs.rclunk(f).await;
    }
    conn.ready.store(false, Ordering::Relaxed);

    let reply = if !version.starts_with(P92000) {
        FCall::RVersion {
            msize: conn.config.msize,
            version: VERSION_UNKNOWN.to_owned(),
        }
    } else if msize < MSIZE_MIN {
        rerror_of(&Error::remote("msize too small", errno::EINVAL))
    } else {
        let msize = msize.min(conn.config.msize);
        let dotu = conn.config.dotu && version == P92000U;
        conn.msize.store(msize, Ordering::Relaxed);
        conn.dotu.store(dotu, Ordering::Relaxed);
        conn.ready.store(true, Ordering::Relaxed);
        FCall::RVersion {
            msize,
            version: if dotu { P92000U } else { P92000 }.to_owned(),
        }
    };

    respond(conn, writer, tag, None, reply).await;
}

/// Validate fid state, run the back-end handler, record the state
/// transition its reply implies.
async fn process<Fs>(conn: &Conn<Fs::FId>, fs: &Fs, body: FCall) -> Result<FCall>
where
    Fs: Filesystem + Send + Sync,
{
    use crate::FCall::*;

    // Clunk and remove release the fid even when the back-end errs.
    if let TClunk { fid } | TRemove { fid } = body {
        let res = {
            let fids = conn.fids.read().await;
            let f = fids
                .get(&fid)
                .ok_or_else(|| Error::remote("unknown fid", errno::EINVAL))?;
            if matches!(body, TClunk { .. }) {
                fs.rclunk(f).await
            } else {
                fs.rremove(f).await
            }
        };
        conn.fids.write().await.remove(&fid);
        return res;
    }

    let mut newfid_obj = body.newfid().map(|fid| FId {
        fid,
        qid: None,
        omode: None,
        uname: String::new(),
        nuname: NONUNAME,
        dotu: conn.dotu.load(Ordering::Relaxed),
        aux: Fs::FId::default(),
    });

    let msize = conn.msize.load(Ordering::Relaxed);

    let response = {
        let fids = conn.fids.read().await;
        let get = |fid: &u32| {
            fids.get(fid)
                .ok_or_else(|| Error::remote("unknown fid", errno::EINVAL))
        };
        let get_new = || {
            newfid_obj
                .as_ref()
                .ok_or_else(|| Error::Protocol("missing newfid".to_owned()))
        };

        match body {
            TAuth {
                afid,
                ref uname,
                ref aname,
                nuname,
            } => {
                if fids.contains_key(&afid) {
                    return Err(Error::remote("fid in use", errno::EINVAL));
                }
                fs.rauth(get_new()?, uname, aname, nuname).await?
            }
            TAttach {
                fid,
                afid,
                ref uname,
                ref aname,
                nuname,
            } => {
                if fids.contains_key(&fid) {
                    return Err(Error::remote("fid in use", errno::EINVAL));
                }
                let af = if afid != NOFID {
                    Some(get(&afid)?)
                } else {
                    None
                };
                fs.rattach(get_new()?, af, uname, aname, nuname).await?
            }
            TWalk {
                fid,
                newfid,
                ref wnames,
            } => {
                let src = get(&fid)?;
                if src.omode.is_some() {
                    return Err(Error::remote("cannot walk open fid", errno::EINVAL));
                }
                if wnames.len() > MAXWELEM {
                    return Err(Error::remote("too many walk elements", errno::EINVAL));
                }
                if !wnames.is_empty() && !src.qid.is_some_and(|q| q.typ.contains(QIdType::DIR)) {
                    return Err(Error::no(errno::ENOTDIR));
                }
                if newfid != fid && fids.contains_key(&newfid) {
                    return Err(Error::remote("fid in use", errno::EINVAL));
                }
                fs.rwalk(src, get_new()?, wnames).await?
            }
            TOpen { fid, mode } => {
                let f = get(&fid)?;
                if f.omode.is_some() {
                    return Err(Error::remote("fid already open", errno::EINVAL));
                }
                fs.ropen(f, mode).await?
            }
            TCreate {
                fid,
                ref name,
                perm,
                mode,
                ref ext,
            } => {
                let f = get(&fid)?;
                if f.omode.is_some() {
                    return Err(Error::remote("fid already open", errno::EINVAL));
                }
                if !f.qid.is_some_and(|q| q.typ.contains(QIdType::DIR)) {
                    return Err(Error::no(errno::ENOTDIR));
                }
                fs.rcreate(f, name, perm, mode, ext).await?
            }
            TRead { fid, offset, count } => {
                let f = get(&fid)?;
                match f.omode {
                    Some(m) if m & 3 != om::WRITE => {}
                    Some(_) => return Err(Error::remote("bad use of fid", errno::EPERM)),
                    None => return Err(Error::remote("fid not open", errno::EINVAL)),
                }
                fs.rread(f, offset, count.min(msize - IOHDRSZ)).await?
            }
            TWrite {
                fid,
                offset,
                ref data,
            } => {
                let f = get(&fid)?;
                match f.omode {
                    Some(m) if matches!(m & 3, om::WRITE | om::RDWR) => {}
                    Some(_) => return Err(Error::remote("bad use of fid", errno::EPERM)),
                    None => return Err(Error::remote("fid not open", errno::EINVAL)),
                }
                fs.rwrite(f, offset, data).await?
            }
            TStat { fid } => fs.rstat(get(&fid)?).await?,
            TWStat { fid, ref stat } => fs.rwstat(get(&fid)?, stat).await?,
            _ => return Err(Error::remote("unexpected message", errno::EINVAL)),
        }
    };

    {
        let mut fids = conn.fids.write().await;
        match (&body, &response) {
            (TAuth { uname, nuname, .. }, RAuth { aqid }) => {
                if let Some(mut nf) = newfid_obj.take() {
                    nf.qid = Some(*aqid);
                    nf.omode = Some(om::RDWR);
                    nf.uname = uname.clone();
                    nf.nuname = *nuname;
                    fids.insert(nf.fid, nf);
                }
            }
            (TAttach { uname, nuname, .. }, RAttach { qid }) => {
                if let Some(mut nf) = newfid_obj.take() {
                    nf.qid = Some(*qid);
                    nf.uname = uname.clone();
                    nf.nuname = *nuname;
                    fids.insert(nf.fid, nf);
                }
            }
            (TWalk { fid, wnames, .. }, RWalk { wqids }) => {
                // A short qid list is a partial walk: newfid stays unbound.
                if wqids.len() == wnames.len() {
                    let (qid, uname, nuname) = match fids.get(fid) {
                        Some(src) => (
                            wqids.last().copied().or(src.qid),
                            src.uname.clone(),
                            src.nuname,
                        ),
                        None => (wqids.last().copied(), String::new(), NONUNAME),
                    };
                    if let Some(mut nf) = newfid_obj.take() {
                        nf.qid = qid;
                        nf.uname = uname;
                        nf.nuname = nuname;
                        fids.insert(nf.fid, nf);
                    }
                }
            }
            (TOpen { fid, mode }, ROpen { qid, .. }) => {
                if let Some(f) = fids.get_mut(fid) {
                    f.omode = Some(*mode);
                    f.qid = Some(*qid);
                }
            }
            (TCreate { fid, mode, .. }, RCreate { qid, .. }) => {
                if let Some(f) = fids.get_mut(fid) {
                    f.omode = Some(*mode);
                    f.qid = Some(*qid);
                }
            }
            _ => {}
        }
    }

    Ok(response)
}

/// Serve one connection over an arbitrary reliable byte stream.
///
/// Useful directly for custom transports; the listeners in [`Srv`] call
/// it for every accepted socket.
pub async fn dispatch<Fs, S>(filesystem: Fs, stream: S, config: SrvConfig) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    S: 'static + AsyncRead + AsyncWrite + Send,
{
    dispatch_conn(filesystem, stream, config, None).await
}

async fn dispatch_conn<Fs, S>(
    filesystem: Fs,
    stream: S,
    config: SrvConfig,
    mut shutdown: Option<watch::Receiver<bool>>,
) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    S: 'static + AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let fs = Arc::new(filesystem);
    let conn = Arc::new(Conn {
        msize: AtomicU32::new(config.msize.max(MSIZE_MIN)),
        dotu: AtomicBool::new(false),
        ready: AtomicBool::new(false),
        fids: RwLock::new(HashMap::new()),
        tags: StdMutex::new(TagTable::default()),
        config,
    });

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(conn.msize.load(Ordering::Relaxed) as usize)
        .new_read(reader);
    let framedwrite: SharedWriter<S> = Arc::new(Mutex::new(
        LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer),
    ));

    loop {
        let next = if let Some(sd) = shutdown.as_mut() {
            tokio::select! {
                _ = sd.changed() => None,
                frame = framedread.next() => frame,
            }
        } else {
            framedread.next().await
        };
        let Some(bytes) = next else { break };
        let bytes = bytes?;

        let dotu = conn.dotu.load(Ordering::Relaxed);
        utils::trace_packet(conn.config.debug, &conn.config.id, '<', &bytes);
        let msg = serialize::read_msg(&mut bytes.reader(), dotu)?;
        utils::trace_fcall(conn.config.debug, &conn.config.id, '<', &msg);

        // Tversion resets the connection, so it runs inline: no request
        // may race the dialect switch.
        if let FCall::TVersion {
            msize,
            ref version,
        } = msg.body
        {
            handle_version(&conn, &*fs, &framedwrite, msg.tag, msize, version).await;
            continue;
        }

        if !conn.ready.load(Ordering::Relaxed) {
            let reply = rerror_of(&Error::remote("must send Tversion first", errno::EINVAL));
            respond(&conn, &framedwrite, msg.tag, None, reply).await;
            continue;
        }

        // Two requests in flight under one tag are a protocol error.
        let is_duplicate_tag = {
            let tags = conn.tags.lock().unwrap();
            tags.live.contains_key(&msg.tag)
        };
        if is_duplicate_tag {
            let reply = rerror_of(&Error::remote("duplicate tag", errno::EINVAL));
            let mut w = framedwrite.lock().await;
            let mut buf = bytes::BytesMut::with_capacity(64).writer();
            let reply = Msg {
                tag: msg.tag,
                body: reply,
            };
            if serialize::write_msg(&mut buf, &reply, dotu).is_ok() {
                let _ = w.send(buf.into_inner().freeze()).await;
            }
            continue;
        }
        let gen_id = {
            let mut tags = conn.tags.lock().unwrap();
            let gen_id = tags.next_gen;
            tags.next_gen += 1;
            tags.live.insert(msg.tag, gen_id);
            gen_id
        };

        let conn = conn.clone();
        let fs = fs.clone();
        let framedwrite = framedwrite.clone();
        tokio::spawn(async move {
            let tag = msg.tag;
            match msg.body {
                FCall::TFlush { oldtag } => {
                    eprintln!("DEBUG: handling flush tag={tag} oldtag={oldtag}");
                    handle_flush(&conn, &*fs, &framedwrite, tag, gen_id, oldtag).await;
                    eprintln!("DEBUG: done flush tag={tag}");
                }
                body => {
                    let response = match process(&conn, &*fs, body).await {
                        Ok(response) => response,
                        Err(e) => {
                            debug!("{}: tag {tag}: {e}", conn.config.id);
                            rerror_of(&e)
                        }
                    };
                    respond(&conn, &framedwrite, tag, Some(gen_id), response).await;
                }
            }
        });
    }

    // Connection gone: give the back-end a chance to release fid state.
    let leftover: Vec<FId<Fs::FId>> = {
        let mut fids = conn.fids.write().await;
        fids.drain().map(|(_, f)| f).collect()
    };
    for f in &leftover {
        let _ = fs.rclunk(f).await;
    }

    Ok(())
}

/// A live connection, as seen through [`Srv::connections`].
#[derive(Clone, Debug)]
pub struct ConnInfo {
    pub id: u64,
    pub peer: String,
}

/// Accepts connections on a listening endpoint and runs one dispatcher
/// per connection.
pub struct Srv<Fs> {
    fs: Fs,
    config: SrvConfig,
    conns: Arc<StdMutex<HashMap<u64, ConnInfo>>>,
    next_conn: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<Fs> Srv<Fs>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    pub fn new(fs: Fs) -> Srv<Fs> {
        Srv::with_config(fs, SrvConfig::default())
    }

    pub fn with_config(fs: Fs, config: SrvConfig) -> Srv<Fs> {
        let (shutdown, _) = watch::channel(false);
        Srv {
            fs,
            config,
            conns: Arc::new(StdMutex::new(HashMap::new())),
            next_conn: AtomicU64::new(0),
            shutdown,
        }
    }

    /// The currently live connections. Introspection only; nothing on
    /// the request path touches this.
    pub fn connections(&self) -> Vec<ConnInfo> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    /// Close the listener and signal every dispatcher to drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Listen on `proto!address!port` (tcp) or `proto!path` (unix) and
    /// serve until [`Srv::shutdown`].
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let (proto, listen_addr) = utils::parse_proto(addr)
            .ok_or_else(|| Error::Argument("invalid protocol or address".to_owned()))?;

        match proto {
            "tcp" => self.listen_tcp(&listen_addr).await,
            "unix" => self.listen_unix(&listen_addr).await,
            _ => Err(Error::Argument("protocol not supported".to_owned())),
        }
    }

    async fn listen_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    self.spawn_conn(stream, peer.to_string());
                }
            }
        }

        info!("listener closed");
        Ok(())
    }

    async fn listen_unix(&self, addr: &str) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let listener = DeleteOnDrop::bind(addr)?;
        let mut shutdown = self.shutdown.subscribe();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down gracefully");
                    self.shutdown();
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down gracefully");
                    self.shutdown();
                }
                result = listener.accept() => {
                    let (stream, _) = result?;
                    self.spawn_conn(stream, addr.to_owned());
                }
            }
        }

        info!("listener closed");
        Ok(())
    }

    fn spawn_conn<S>(&self, stream: S, peer: String)
    where
        S: 'static + AsyncRead + AsyncWrite + Send,
    {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        info!("accepted: {peer}");
        self.conns.lock().unwrap().insert(
            id,
            ConnInfo {
                id,
                peer: peer.clone(),
            },
        );

        let fs = self.fs.clone();
        let config = self.config.clone();
        let conns = self.conns.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = dispatch_conn(fs, stream, config, Some(shutdown)).await {
                error!("connection {peer}: {e}");
            }
            conns.lock().unwrap().remove(&id);
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

/// Serve `filesystem` on `addr` with the default configuration.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    Srv::new(filesystem).listen(addr).await
}

/// Serve `filesystem` on `addr` with explicit connection knobs.
pub async fn srv_async_with<Fs>(filesystem: Fs, addr: &str, config: SrvConfig) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    Srv::with_config(filesystem, config).listen(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::pack_stat;

    fn sample_dir(names: &[&str]) -> Vec<u8> {
        let mut packed = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let stat = Stat {
                typ: 0,
                dev: 0,
                qid: QId {
                    typ: QIdType::FILE,
                    version: 0,
                    path: i as u64 + 1,
                },
                mode: 0o644,
                atime: 0,
                mtime: 0,
                length: 0,
                name: (*name).to_owned(),
                uid: "none".to_owned(),
                gid: "none".to_owned(),
                muid: "none".to_owned(),
                ext: String::new(),
                uidnum: NONUNAME,
                gidnum: NONUNAME,
                muidnum: NONUNAME,
            };
            packed.extend(pack_stat(&stat, false).unwrap());
        }
        packed
    }

    #[test]
    fn chunk_respects_record_boundaries() {
        let packed = sample_dir(&["a", "bb", "ccc"]);
        let first = dir_read_chunk(&packed, 0, packed.len() as u32).unwrap();
        assert_eq!(first, &packed[..]);

        // A count covering only the first record must cut exactly there.
        let sz = u16::from_le_bytes([packed[0], packed[1]]) as usize + 2;
        let one = dir_read_chunk(&packed, 0, sz as u32).unwrap();
        assert_eq!(one.len(), sz);

        let rest = dir_read_chunk(&packed, sz as u64, packed.len() as u32).unwrap();
        assert_eq!(rest, &packed[sz..]);
    }

    #[test]
    fn chunk_refuses_partial_record() {
        let packed = sample_dir(&["a", "bb"]);
        let err = dir_read_chunk(&packed, 0, 10).unwrap_err();
        match err {
            Error::Remote { ename, .. } => {
                assert_eq!(ename, "too small read size for dir entry")
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn chunk_refuses_misaligned_offset() {
        let packed = sample_dir(&["a", "bb"]);
        assert!(dir_read_chunk(&packed, 3, 4096).is_err());
    }

    #[test]
    fn chunk_past_end_is_eof() {
        let packed = sample_dir(&["a"]);
        let eof = dir_read_chunk(&packed, packed.len() as u64, 4096).unwrap();
        assert!(eof.is_empty());
    }
}
