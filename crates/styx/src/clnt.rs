//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u
//!
//! A [`Clnt`] owns one connection to a 9P file server and multiplexes
//! any number of concurrent requests over it, pairing replies to callers
//! by tag. Two tasks run per connection: a sender draining a bounded
//! queue onto the transport, and a receiver framing replies and waking
//! waiters. Callers block on their own request's completion, never on
//! the connection.

use {
    crate::{
        error::{Error, errno},
        fcall::*,
        io_err,
        pool::Pool,
        serialize::{self, UnpackError},
        user::{OsUsers, User},
        utils::{self, Result},
    },
    bytes::{Buf, BytesMut},
    log::error,
    std::{
        collections::HashMap,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::{TcpStream, UnixStream},
        sync::{mpsc, oneshot, watch},
    },
};

/// Connection knobs for [`Clnt::connect_with`].
#[derive(Clone, Debug)]
pub struct ClntConfig {
    /// Message size to offer in version negotiation.
    pub msize: u32,
    /// Ask for the ".u" dialect. Spoken only if the server agrees.
    pub dotu: bool,
    /// Tracing switches, see [`DebugFlags`].
    pub debug: DebugFlags,
    /// Used when printing debug messages.
    pub id: String,
}

impl Default for ClntConfig {
    fn default() -> Self {
        ClntConfig {
            msize: MSIZE_DEFAULT,
            dotu: true,
            debug: DebugFlags::empty(),
            id: "styx".to_owned(),
        }
    }
}

/// A file handle on the server, with its identity and open state.
///
/// Handles are created by attach, auth and walk, and consumed by clunk
/// and remove. Dropping one without clunking leaks the server-side fid
/// until the connection goes away.
#[derive(Debug)]
pub struct FId {
    fid: u32,
    /// The server's identity for the file this handle points at.
    pub qid: QId,
    /// Server-advised atomic I/O unit, 0 until open.
    pub iounit: u32,
    mode: Option<u8>,
}

impl FId {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The open mode, if the handle has been opened.
    pub fn open_mode(&self) -> Option<u8> {
        self.mode
    }
}

/// A submitted request whose reply has not been awaited yet.
///
/// Returned by [`Clnt::rpc_begin`], the non-blocking submission
/// primitive. The request is on its way (or queued) once this exists;
/// [`Transaction::wait`] parks the caller until the reply lands.
#[derive(Debug)]
pub struct Transaction {
    tag: u16,
    done: oneshot::Receiver<Result<Msg>>,
}

impl Transaction {
    /// The tag the request went out under, usable with [`Clnt::flush`].
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Await the matching reply.
    pub async fn wait(self) -> Result<Msg> {
        eprintln!("DEBUG: wait() entered, tag={}", self.tag);
        let r = self.done
            .await
            .unwrap_or_else(|_| Err(Error::Protocol("request dropped without a reply".to_owned())));
        eprintln!("DEBUG: wait() resolved, tag={}", self.tag);
        r
    }
}

struct Pending {
    req_type: MsgType,
    sent: oneshot::Receiver<()>,
    done: oneshot::Sender<Result<Msg>>,
}

struct Outbound {
    pkt: Vec<u8>,
    sent: oneshot::Sender<()>,
}

struct Mux {
    inflight: HashMap<u16, Pending>,
    err: Option<Error>,
}

/// A live client connection, as enumerated by [`connections`].
#[derive(Clone, Debug)]
pub struct ClntInfo {
    pub id: u64,
    pub name: String,
}

static CLNTS: Mutex<Vec<ClntInfo>> = Mutex::new(Vec::new());
static NEXT_CLNT: AtomicU64 = AtomicU64::new(0);

/// The client connections currently live in this process.
///
/// Introspection only; nothing on the request path touches this.
pub fn connections() -> Vec<ClntInfo> {
    CLNTS.lock().unwrap().clone()
}

struct ClntInner {
    msize: AtomicU32,
    dotu: AtomicBool,
    debug: DebugFlags,
    id: String,
    reg_id: u64,
    mux: Mutex<Mux>,
    tags: Pool,
    fids: Pool,
    to_sender: mpsc::Sender<Outbound>,
    closing: watch::Sender<bool>,
    root: Mutex<Option<(u32, QId)>>,
}

/// A 9P2000 client connected to a file server.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Clnt {
    inner: Arc<ClntInner>,
}

impl ClntInner {
    fn latch(&self, err: Error) {
        {
            let mut mux = self.mux.lock().unwrap();
            if mux.err.is_none() {
                mux.err = Some(err);
            }
        }
        let _ = self.closing.send(true);
    }

    fn latched_or(&self, fallback: Error) -> Error {
        self.mux.lock().unwrap().err.clone().unwrap_or(fallback)
    }

    /// Fail every in-flight request with the one latched error.
    fn teardown(&self, err: Error) {
        CLNTS.lock().unwrap().retain(|c| c.id != self.reg_id);

        let (e, victims) = {
            let mut mux = self.mux.lock().unwrap();
            if mux.err.is_none() {
                mux.err = Some(err);
            }
            let e = mux.err.clone().unwrap();
            let victims: Vec<_> = mux.inflight.drain().collect();
            (e, victims)
        };
        let _ = self.closing.send(true);

        for (tag, p) in victims {
            let _ = p.done.send(Err(e.clone()));
            if tag != NOTAG {
                self.tags.release(tag as u32);
            }
        }
    }

    /// Hand a framed reply to its waiter. An error return is fatal for
    /// the connection.
    async fn deliver(&self, msg: Msg) -> ::std::result::Result<(), Error> {
        utils::trace_fcall(self.debug, &self.id, '<', &msg);

        let pending = { self.mux.lock().unwrap().inflight.remove(&msg.tag) };
        let Some(p) = pending else {
            return Err(Error::Protocol("unexpected response".to_owned()));
        };

        // A reply can be framed before the sender observes its own write
        // returning. Completing the caller before the sent signal would
        // hand the in-flight record back while the sender still holds it,
        // so block here until the send is accounted for.
        let _ = p.sent.await;

        let tag = msg.tag;
        let rtype = MsgType::from(&msg.body);
        let result = if rtype as u8 == p.req_type as u8 + 1 {
            Ok(msg)
        } else if let FCall::RError { ename, errno } = msg.body {
            Err(Error::Remote { ename, errno })
        } else {
            let invalid = Error::Protocol("invalid response".to_owned());
            let _ = p.done.send(Err(invalid.clone()));
            if tag != NOTAG {
                self.tags.release(tag as u32);
            }
            return Err(invalid);
        };

        let _ = p.done.send(result);
        if tag != NOTAG {
            self.tags.release(tag as u32);
        }
        Ok(())
    }
}

async fn send_loop<W>(
    inner: Arc<ClntInner>,
    mut wr: W,
    mut rx: mpsc::Receiver<Outbound>,
    mut closing: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let out = tokio::select! {
            _ = closing.changed() => break,
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        utils::trace_packet(inner.debug, &inner.id, '>', &out.pkt);
        let res = wr.write_all(&out.pkt).await;
        // The sent signal fires even on failure so nothing waits on a
        // write that will never be accounted for.
        let _ = out.sent.send(());
        if let Err(e) = res {
            inner.latch(Error::Transport(e));
            break;
        }
    }
}

async fn recv_loop<R>(inner: Arc<ClntInner>, mut rd: R, mut closing: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(inner.msize.load(Ordering::Relaxed) as usize);

    let err = 'conn: loop {
        loop {
            let dotu = inner.dotu.load(Ordering::Relaxed);
            match serialize::unpack(&buf, dotu) {
                Ok((msg, consumed)) => {
                    utils::trace_packet(inner.debug, &inner.id, '<', &buf[..consumed]);
                    buf.advance(consumed);
                    if let Err(e) = inner.deliver(msg).await {
                        break 'conn e;
                    }
                }
                Err(UnpackError::NeedMore(want)) => {
                    let msize = inner.msize.load(Ordering::Relaxed) as usize;
                    if want > msize {
                        break 'conn Error::Protocol(format!(
                            "peer frame of {want} bytes exceeds msize {msize}"
                        ));
                    }
                    if buf.capacity() - buf.len() < msize {
                        // Room for the incoming frame and then some.
                        buf.reserve(msize * 8);
                    }
                    break;
                }
                Err(UnpackError::Malformed(m)) => break 'conn Error::Protocol(m),
            }
        }

        tokio::select! {
            _ = closing.changed() => {
                break 'conn inner.latched_or(Error::Transport(io_err!(
                    ConnectionAborted,
                    "connection closed"
                )));
            }
            n = rd.read_buf(&mut buf) => match n {
                Ok(0) => {
                    break 'conn Error::Transport(io_err!(
                        UnexpectedEof,
                        "connection closed by peer"
                    ));
                }
                Ok(_) => {}
                Err(e) => break 'conn Error::Transport(e),
            },
        }
    };

    if err.is_fatal() {
        error!("{}: {}", inner.id, err);
    }
    inner.teardown(err);
}

impl Clnt {
    /// Connect over an established stream, negotiating version, msize
    /// and dialect. The stream must be a reliable bidirectional byte
    /// stream; TCP and unix sockets are the usual suspects.
    pub async fn connect<S>(stream: S, msize: u32, dotu: bool) -> Result<Clnt>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Clnt::connect_with(
            stream,
            ClntConfig {
                msize,
                dotu,
                ..Default::default()
            },
        )
        .await
    }

    /// [`Clnt::connect`] with full control over the connection knobs.
    pub async fn connect_with<S>(stream: S, config: ClntConfig) -> Result<Clnt>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(16);
        let (closing_tx, closing_rx) = watch::channel(false);

        let reg_id = NEXT_CLNT.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ClntInner {
            msize: AtomicU32::new(config.msize.max(MSIZE_MIN)),
            dotu: AtomicBool::new(config.dotu),
            debug: config.debug,
            id: config.id,
            reg_id,
            mux: Mutex::new(Mux {
                inflight: HashMap::new(),
                err: None,
            }),
            tags: Pool::new(NOTAG as u32),
            fids: Pool::new(NOFID),
            to_sender: tx,
            closing: closing_tx,
            root: Mutex::new(None),
        });
        CLNTS.lock().unwrap().push(ClntInfo {
            id: reg_id,
            name: inner.id.clone(),
        });

        tokio::spawn(send_loop(inner.clone(), wr, rx, closing_rx.clone()));
        tokio::spawn(recv_loop(inner.clone(), rd, closing_rx));

        let clnt = Clnt { inner };
        if let Err(e) = clnt.version().await {
            clnt.unmount();
            return Err(e);
        }
        Ok(clnt)
    }

    /// Dial `proto!addr!port` (tcp) or `proto!path` (unix), connect and
    /// attach as the calling OS user. The returned client has its root
    /// fid established, ready for the path-based helpers.
    pub async fn mount(addr: &str, aname: &str, msize: u32) -> Result<Clnt> {
        let user = OsUsers::current()
            .map_err(|e| Error::Argument(format!("cannot resolve current user: {e}")))?;
        Clnt::mount_as(addr, aname, msize, &user).await
    }

    /// [`Clnt::mount`] with an explicit identity.
    pub async fn mount_as(addr: &str, aname: &str, msize: u32, user: &dyn User) -> Result<Clnt> {
        let (proto, dial) = utils::parse_proto(addr)
            .ok_or_else(|| Error::Argument("invalid protocol or address".to_owned()))?;

        let clnt = match proto {
            "tcp" => {
                let stream = TcpStream::connect(&dial).await.map_err(Error::Transport)?;
                Clnt::connect(stream, msize + IOHDRSZ, true).await?
            }
            "unix" => {
                let stream = UnixStream::connect(&dial).await.map_err(Error::Transport)?;
                Clnt::connect(stream, msize + IOHDRSZ, true).await?
            }
            _ => return Err(Error::Argument("protocol not supported".to_owned())),
        };

        match clnt.attach(None, user, aname).await {
            Ok(_) => Ok(clnt),
            Err(e) => {
                clnt.unmount();
                Err(e)
            }
        }
    }

    /// Close the connection. Every in-flight and subsequent request
    /// fails with the latched error.
    pub fn unmount(&self) {
        self.inner
            .teardown(Error::Transport(io_err!(Other, "connection closed")));
    }

    /// The msize negotiated for this connection.
    pub fn msize(&self) -> u32 {
        self.inner.msize.load(Ordering::Relaxed)
    }

    /// Whether the ".u" dialect was negotiated.
    pub fn dotu(&self) -> bool {
        self.inner.dotu.load(Ordering::Relaxed)
    }

    async fn version(&self) -> Result<()> {
        let msize = self.inner.msize.load(Ordering::Relaxed);
        let want_dotu = self.inner.dotu.load(Ordering::Relaxed);
        let version = if want_dotu { P92000U } else { P92000 };

        let rc = self
            .rpc(FCall::TVersion {
                msize,
                version: version.to_owned(),
            })
            .await?;

        match rc.body {
            FCall::RVersion {
                msize: peer_msize,
                version: peer_version,
            } => {
                if !peer_version.starts_with(P92000) {
                    return Err(Error::Protocol(format!(
                        "peer does not speak 9P2000: {peer_version:?}"
                    )));
                }
                if peer_msize < MSIZE_MIN {
                    return Err(Error::Protocol(format!(
                        "peer msize {peer_msize} below protocol minimum"
                    )));
                }
                if peer_msize < msize {
                    self.inner.msize.store(peer_msize, Ordering::Relaxed);
                }
                self.inner
                    .dotu
                    .store(want_dotu && peer_version == P92000U, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::Protocol("invalid version reply".to_owned())),
        }
    }

    /// Submit a request without waiting for its reply.
    ///
    /// Suspends only on submission back-pressure. The request is
    /// registered in the in-flight set before it is handed to the
    /// sender, so the reply can never outrun its record.
    pub async fn rpc_begin(&self, body: FCall) -> Result<Transaction> {
        let inner = &self.inner;
        let dotu = inner.dotu.load(Ordering::Relaxed);

        let tag = if matches!(body, FCall::TVersion { .. }) {
            NOTAG
        } else {
            inner
                .tags
                .acquire()
                .ok_or_else(|| Error::Argument("tag space exhausted".to_owned()))? as u16
        };
        let release_tag = |i: &ClntInner| {
            if tag != NOTAG {
                i.tags.release(tag as u32);
            }
        };

        let msg = Msg { tag, body };
        let pkt = match serialize::pack(&msg, dotu) {
            Ok(pkt) => pkt,
            Err(e) => {
                release_tag(inner);
                return Err(Error::Argument(e.to_string()));
            }
        };

        let (sent_tx, sent_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut mux = inner.mux.lock().unwrap();
            if let Some(e) = &mux.err {
                let e = e.clone();
                drop(mux);
                release_tag(inner);
                return Err(e);
            }
            if mux.inflight.contains_key(&tag) {
                drop(mux);
                return Err(Error::State("tag already in flight".to_owned()));
            }
            mux.inflight.insert(
                tag,
                Pending {
                    req_type: MsgType::from(&msg.body),
                    sent: sent_rx,
                    done: done_tx,
                },
            );
        }

        utils::trace_fcall(inner.debug, &inner.id, '>', &msg);
        if inner
            .to_sender
            .send(Outbound { pkt, sent: sent_tx })
            .await
            .is_err()
        {
            let e = {
                let mut mux = inner.mux.lock().unwrap();
                mux.inflight.remove(&tag);
                mux.err
                    .clone()
                    .unwrap_or_else(|| Error::Protocol("connection closed".to_owned()))
            };
            release_tag(inner);
            return Err(e);
        }

        Ok(Transaction { tag, done: done_rx })
    }

    /// Submit a request and wait for its reply.
    pub async fn rpc(&self, body: FCall) -> Result<Msg> {
        self.rpc_begin(body).await?.wait().await
    }

    fn new_fid(&self) -> Result<u32> {
        self.inner
            .fids
            .acquire()
            .ok_or_else(|| Error::Argument("fid space exhausted".to_owned()))
    }

    /// Create an authentication fid for the given user, to run the
    /// auth protocol over before attach.
    pub async fn auth(&self, user: &dyn User, aname: &str) -> Result<FId> {
        let afid = self.new_fid()?;
        let res = self
            .rpc(FCall::TAuth {
                afid,
                uname: user.name().to_owned(),
                aname: aname.to_owned(),
                nuname: user.id(),
            })
            .await;

        match res {
            Ok(Msg {
                body: FCall::RAuth { aqid },
                ..
            }) => Ok(FId {
                fid: afid,
                qid: aqid,
                iounit: 0,
                mode: Some(om::RDWR),
            }),
            Ok(_) => {
                self.inner.fids.release(afid);
                Err(Error::Protocol("invalid response".to_owned()))
            }
            Err(e) => {
                self.inner.fids.release(afid);
                Err(e)
            }
        }
    }

    /// Attach to the file tree `aname` as `user`, returning the root
    /// fid. The root is also remembered for the path-based helpers.
    pub async fn attach(&self, afid: Option<&FId>, user: &dyn User, aname: &str) -> Result<FId> {
        let fid = self.new_fid()?;
        let res = self
            .rpc(FCall::TAttach {
                fid,
                afid: afid.map_or(NOFID, |f| f.fid),
                uname: user.name().to_owned(),
                aname: aname.to_owned(),
                nuname: user.id(),
            })
            .await;

        match res {
            Ok(Msg {
                body: FCall::RAttach { qid },
                ..
            }) => {
                *self.inner.root.lock().unwrap() = Some((fid, qid));
                Ok(FId {
                    fid,
                    qid,
                    iounit: 0,
                    mode: None,
                })
            }
            Ok(_) => {
                self.inner.fids.release(fid);
                Err(Error::Protocol("invalid response".to_owned()))
            }
            Err(e) => {
                self.inner.fids.release(fid);
                Err(e)
            }
        }
    }

    /// Walk from `fid` through `wnames` to a new fid.
    ///
    /// At most [`MAXWELEM`] names travel per message; longer paths walk
    /// in rounds reusing the new fid. A partial walk is an error here:
    /// the half-bound fid is clunked and nothing leaks.
    pub async fn walk(&self, fid: &FId, wnames: &[&str]) -> Result<FId> {
        self.walk_from(fid.fid, fid.qid, wnames).await
    }

    async fn walk_from(&self, src: u32, src_qid: QId, wnames: &[&str]) -> Result<FId> {
        let newfid = self.new_fid()?;
        let mut qid = src_qid;
        let mut from = src;
        let mut left = wnames;
        let mut bound = false;

        loop {
            let take = left.len().min(MAXWELEM);
            let (chunk, rest) = left.split_at(take);

            let res = self
                .rpc(FCall::TWalk {
                    fid: from,
                    newfid,
                    wnames: chunk.iter().map(|s| (*s).to_owned()).collect(),
                })
                .await;

            match res {
                Ok(Msg {
                    body: FCall::RWalk { wqids },
                    ..
                }) => {
                    if wqids.len() != take {
                        // The server stopped short; newfid was not bound
                        // by this round.
                        if bound {
                            let _ = self.rpc(FCall::TClunk { fid: newfid }).await;
                        }
                        self.inner.fids.release(newfid);
                        return Err(Error::no(errno::ENOENT));
                    }
                    if let Some(q) = wqids.last() {
                        qid = *q;
                    }
                    bound = true;
                }
                Ok(_) => {
                    if bound {
                        let _ = self.rpc(FCall::TClunk { fid: newfid }).await;
                    }
                    self.inner.fids.release(newfid);
                    return Err(Error::Protocol("invalid response".to_owned()));
                }
                Err(e) => {
                    if bound {
                        let _ = self.rpc(FCall::TClunk { fid: newfid }).await;
                    }
                    self.inner.fids.release(newfid);
                    return Err(e);
                }
            }

            left = rest;
            from = newfid;
            if left.is_empty() {
                break;
            }
        }

        Ok(FId {
            fid: newfid,
            qid,
            iounit: 0,
            mode: None,
        })
    }

    /// Open a walked fid.
    pub async fn open(&self, fid: &mut FId, mode: u8) -> Result<()> {
        if fid.mode.is_some() {
            return Err(Error::State("fid already open".to_owned()));
        }

        match self.rpc(FCall::TOpen { fid: fid.fid, mode }).await?.body {
            FCall::ROpen { qid, iounit } => {
                fid.qid = qid;
                fid.iounit = iounit;
                fid.mode = Some(mode);
                Ok(())
            }
            _ => Err(Error::Protocol("invalid response".to_owned())),
        }
    }

    /// Create and open `name` in the directory `fid` points at. On
    /// success the fid points at the new file. `ext` carries the ".u"
    /// special-file description and is ignored on base connections.
    pub async fn create(
        &self,
        fid: &mut FId,
        name: &str,
        perm: u32,
        mode: u8,
        ext: &str,
    ) -> Result<()> {
        if fid.mode.is_some() {
            return Err(Error::State("fid already open".to_owned()));
        }

        let res = self
            .rpc(FCall::TCreate {
                fid: fid.fid,
                name: name.to_owned(),
                perm,
                mode,
                ext: ext.to_owned(),
            })
            .await?;

        match res.body {
            FCall::RCreate { qid, iounit } => {
                fid.qid = qid;
                fid.iounit = iounit;
                fid.mode = Some(mode);
                Ok(())
            }
            _ => Err(Error::Protocol("invalid response".to_owned())),
        }
    }

    fn iounit_of(&self, fid: &FId) -> u32 {
        let max = self.msize() - IOHDRSZ;
        if fid.iounit == 0 || fid.iounit > max {
            max
        } else {
            fid.iounit
        }
    }

    /// Read up to `count` bytes at `offset`. The count is clamped to
    /// what one message can carry.
    pub async fn read(&self, fid: &FId, offset: u64, count: u32) -> Result<Vec<u8>> {
        if fid.mode.is_none() {
            return Err(Error::State("fid not open".to_owned()));
        }

        let count = count.min(self.iounit_of(fid));
        let res = self
            .rpc(FCall::TRead {
                fid: fid.fid,
                offset,
                count,
            })
            .await?;

        match res.body {
            FCall::RRead { data } => Ok(data.0),
            _ => Err(Error::Protocol("invalid response".to_owned())),
        }
    }

    /// Write as much of `data` at `offset` as one message carries,
    /// returning the count the server took.
    pub async fn write(&self, fid: &FId, offset: u64, data: &[u8]) -> Result<u32> {
        if fid.mode.is_none() {
            return Err(Error::State("fid not open".to_owned()));
        }

        let n = (data.len() as u64).min(self.iounit_of(fid) as u64) as usize;
        let res = self
            .rpc(FCall::TWrite {
                fid: fid.fid,
                offset,
                data: Data(data[..n].to_vec()),
            })
            .await?;

        match res.body {
            FCall::RWrite { count } => Ok(count),
            _ => Err(Error::Protocol("invalid response".to_owned())),
        }
    }

    /// Write all of `data` at `offset`, splitting into as many messages
    /// as it takes.
    pub async fn write_all(&self, fid: &FId, mut offset: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write(fid, offset, data).await?;
            if n == 0 {
                return Err(Error::remote("short write", errno::EIO));
            }
            offset += n as u64;
            data = &data[n as usize..];
        }
        Ok(())
    }

    /// Release the fid. The handle is gone either way; the server drops
    /// its side even when it reports an error.
    pub async fn clunk(&self, fid: FId) -> Result<()> {
        let res = self.rpc(FCall::TClunk { fid: fid.fid }).await;
        self.inner.fids.release(fid.fid);
        res.map(|_| ())
    }

    /// Remove the file and release the fid, clunking it implicitly.
    pub async fn remove(&self, fid: FId) -> Result<()> {
        let res = self.rpc(FCall::TRemove { fid: fid.fid }).await;
        self.inner.fids.release(fid.fid);
        res.map(|_| ())
    }

    /// The metadata for the file the fid points at.
    pub async fn stat(&self, fid: &FId) -> Result<Stat> {
        match self.rpc(FCall::TStat { fid: fid.fid }).await?.body {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(Error::Protocol("invalid response".to_owned())),
        }
    }

    /// Modify the metadata for the file the fid points at. Fields at
    /// their sentinel values are left alone, see [`Stat::unchanged`].
    pub async fn wstat(&self, fid: &FId, stat: &Stat) -> Result<()> {
        self.rpc(FCall::TWStat {
            fid: fid.fid,
            stat: stat.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Rename the file, leaving everything else untouched.
    pub async fn rename(&self, fid: &FId, name: &str) -> Result<()> {
        let mut stat = Stat::unchanged();
        stat.name = name.to_owned();
        self.wstat(fid, &stat).await
    }

    /// Ask the server to flush the file to stable storage, expressed as
    /// an all-sentinel wstat.
    pub async fn sync(&self, fid: &FId) -> Result<()> {
        self.wstat(fid, &Stat::unchanged()).await
    }

    /// Abandon the outstanding request submitted under `oldtag`. After
    /// a successful flush its waiter fails with [`Error::Flushed`] and
    /// the tag is free for reuse.
    pub async fn flush(&self, oldtag: u16) -> Result<()> {
        eprintln!("DEBUG: client sending flush for oldtag={oldtag}");
        self.rpc(FCall::TFlush { oldtag }).await?;
        eprintln!("DEBUG: client got flush reply for oldtag={oldtag}");

        let pending = { self.inner.mux.lock().unwrap().inflight.remove(&oldtag) };
        eprintln!("DEBUG: pending found = {}", pending.is_some());
        if let Some(p) = pending {
            let r = p.done.send(Err(Error::Flushed));
            eprintln!("DEBUG: sent done err, ok={}", r.is_ok());
            if oldtag != NOTAG {
                self.inner.tags.release(oldtag as u32);
            }
        }
        Ok(())
    }

    /// Read a whole directory through an open fid, decoding the packed
    /// stat records.
    pub async fn read_dir(&self, fid: &FId) -> Result<Vec<Stat>> {
        let dotu = self.dotu();
        let mut stats = Vec::new();
        let mut offset = 0u64;

        loop {
            let chunk = self.read(fid, offset, self.msize() - IOHDRSZ).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;

            let mut cur = std::io::Cursor::new(&chunk[..]);
            while (cur.position() as usize) < chunk.len() {
                let stat = serialize::read_stat(&mut cur, dotu)
                    .map_err(|e| Error::Protocol(format!("bad directory entry: {e}")))?;
                stats.push(stat);
            }
        }

        Ok(stats)
    }

    fn root(&self) -> Result<(u32, QId)> {
        let root = *self.inner.root.lock().unwrap();
        root.ok_or_else(|| Error::State("not attached".to_owned()))
    }

    /// Walk a slash-separated path from the root fid.
    pub async fn fwalk(&self, path: &str) -> Result<FId> {
        let (rfid, rqid) = self.root()?;
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.walk_from(rfid, rqid, &names).await
    }

    /// Walk to `path` and open it.
    pub async fn fopen(&self, path: &str, mode: u8) -> Result<FId> {
        let mut fid = self.fwalk(path).await?;
        match self.open(&mut fid, mode).await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Create `path` (its directory must exist) and open it.
    pub async fn fcreate(&self, path: &str, perm: u32, mode: u8) -> Result<FId> {
        let (dir, name) = match path.rfind('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("", path),
        };
        if name.is_empty() {
            return Err(Error::Argument("create needs a file name".to_owned()));
        }

        let mut fid = self.fwalk(dir).await?;
        match self.create(&mut fid, name, perm, mode, "").await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Remove the file at `path`.
    pub async fn fremove(&self, path: &str) -> Result<()> {
        let fid = self.fwalk(path).await?;
        self.remove(fid).await
    }

    /// The metadata for the file at `path`.
    pub async fn fstat(&self, path: &str) -> Result<Stat> {
        let fid = self.fwalk(path).await?;
        let res = self.stat(&fid).await;
        let _ = self.clunk(fid).await;
        res
    }
}
