//! End-to-end client/server sessions over an in-memory byte stream.

use {
    async_trait::async_trait,
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
        time::Duration,
    },
    styx::{
        Data, Error, FCall, Msg, NOFID, NONUNAME, QId, QIdType, Stat, StaticUser, dm, errno, om,
        clnt::{self, Clnt, ClntConfig},
        serialize,
        srv::{FId, Filesystem, SrvConfig, dir_read_chunk, dispatch},
    },
    tokio::io::{AsyncReadExt, AsyncWriteExt},
};

const ROOT: u64 = 1;

struct Node {
    name: String,
    parent: u64,
    kind: NodeKind,
}

enum NodeKind {
    Dir(Vec<u64>),
    File(Vec<u8>),
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next: u64,
}

impl Tree {
    fn qid_of(&self, path: u64) -> QId {
        let typ = match self.nodes.get(&path).map(|n| &n.kind) {
            Some(NodeKind::Dir(_)) => QIdType::DIR,
            _ => QIdType::FILE,
        };
        QId {
            typ,
            version: 0,
            path,
        }
    }

    fn lookup(&self, dir: u64, name: &str) -> Option<u64> {
        match self.nodes.get(&dir)?.kind {
            NodeKind::Dir(ref children) => children
                .iter()
                .copied()
                .find(|c| self.nodes.get(c).is_some_and(|n| n.name == name)),
            NodeKind::File(_) => None,
        }
    }

    fn stat_of(&self, path: u64) -> Option<Stat> {
        let node = self.nodes.get(&path)?;
        let (mode, length) = match &node.kind {
            NodeKind::Dir(_) => (dm::DIR | 0o755, 0),
            NodeKind::File(data) => (0o644, data.len() as u64),
        };
        Some(Stat {
            typ: 0,
            dev: 0,
            qid: self.qid_of(path),
            mode,
            atime: 0,
            mtime: 0,
            length,
            name: node.name.clone(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
            ext: String::new(),
            uidnum: 1000,
            gidnum: 1000,
            muidnum: 1000,
        })
    }

    fn insert(&mut self, parent: u64, name: &str, kind: NodeKind) -> u64 {
        let path = self.next;
        self.next += 1;
        self.nodes.insert(
            path,
            Node {
                name: name.to_owned(),
                parent,
                kind,
            },
        );
        if let Some(Node {
            kind: NodeKind::Dir(children),
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.push(path);
        }
        path
    }

    fn unlink(&mut self, path: u64) {
        if let Some(node) = self.nodes.remove(&path) {
            if let Some(Node {
                kind: NodeKind::Dir(children),
                ..
            }) = self.nodes.get_mut(&node.parent)
            {
                children.retain(|c| *c != path);
            }
        }
    }
}

#[derive(Clone)]
struct SynthFs {
    tree: Arc<Mutex<Tree>>,
}

impl SynthFs {
    fn new() -> SynthFs {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                name: "/".to_owned(),
                parent: ROOT,
                kind: NodeKind::Dir(Vec::new()),
            },
        );
        SynthFs {
            tree: Arc::new(Mutex::new(Tree { nodes, next: 2 })),
        }
    }

    fn add_dir(&self, parent: u64, name: &str) -> u64 {
        self.tree
            .lock()
            .unwrap()
            .insert(parent, name, NodeKind::Dir(Vec::new()))
    }

    fn add_file(&self, parent: u64, name: &str, data: &[u8]) -> u64 {
        self.tree
            .lock()
            .unwrap()
            .insert(parent, name, NodeKind::File(data.to_vec()))
    }

    fn fid_path<T>(fid: &FId<T>) -> styx::Result<u64> {
        fid.qid()
            .map(|q| q.path)
            .ok_or_else(|| Error::remote("fid not walked", errno::EINVAL))
    }
}

#[async_trait]
impl Filesystem for SynthFs {
    type FId = ();

    async fn rattach(
        &self,
        _fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _nuname: u32,
    ) -> styx::Result<FCall> {
        Ok(FCall::RAttach {
            qid: self.tree.lock().unwrap().qid_of(ROOT),
        })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> styx::Result<FCall> {
        let tree = self.tree.lock().unwrap();
        let mut cur = Self::fid_path(fid)?;
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            match tree.lookup(cur, name) {
                Some(next) => {
                    wqids.push(tree.qid_of(next));
                    cur = next;
                }
                None if i == 0 => return Err(Error::no(errno::ENOENT)),
                None => break,
            }
        }

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> styx::Result<FCall> {
        let path = Self::fid_path(fid)?;
        let qid = self.tree.lock().unwrap().qid_of(path);
        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        _mode: u8,
        _ext: &str,
    ) -> styx::Result<FCall> {
        let parent = Self::fid_path(fid)?;
        let mut tree = self.tree.lock().unwrap();
        if tree.lookup(parent, name).is_some() {
            return Err(Error::remote("file exists", errno::EINVAL));
        }
        let kind = if perm & dm::DIR != 0 {
            NodeKind::Dir(Vec::new())
        } else {
            NodeKind::File(Vec::new())
        };
        let path = tree.insert(parent, name, kind);
        Ok(FCall::RCreate {
            qid: tree.qid_of(path),
            iounit: 0,
        })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> styx::Result<FCall> {
        let path = Self::fid_path(fid)?;

        let (data, delay) = {
            let tree = self.tree.lock().unwrap();
            let node = tree
                .nodes
                .get(&path)
                .ok_or_else(|| Error::no(errno::ENOENT))?;

            match &node.kind {
                NodeKind::Dir(children) => {
                    let mut packed = Vec::new();
                    for child in children {
                        let stat = tree.stat_of(*child).unwrap();
                        packed.extend(serialize::pack_stat(&stat, fid.dotu())?);
                    }
                    (dir_read_chunk(&packed, offset, count)?.to_vec(), None)
                }
                NodeKind::File(data) => {
                    let start = (offset as usize).min(data.len());
                    let end = (start + count as usize).min(data.len());
                    let delay = match node.name.as_str() {
                        "slow" => Some(Duration::from_millis(150)),
                        "hang" => Some(Duration::from_secs(3600)),
                        _ => None,
                    };
                    (data[start..end].to_vec(), delay)
                }
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(FCall::RRead { data: Data(data) })
    }

    async fn rwrite(
        &self,
        fid: &FId<Self::FId>,
        offset: u64,
        data: &Data,
    ) -> styx::Result<FCall> {
        let path = Self::fid_path(fid)?;
        let mut tree = self.tree.lock().unwrap();
        let node = tree
            .nodes
            .get_mut(&path)
            .ok_or_else(|| Error::no(errno::ENOENT))?;

        match &mut node.kind {
            NodeKind::File(content) => {
                let end = offset as usize + data.0.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset as usize..end].copy_from_slice(&data.0);
                Ok(FCall::RWrite {
                    count: data.0.len() as u32,
                })
            }
            NodeKind::Dir(_) => Err(Error::no(errno::EPERM)),
        }
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> styx::Result<FCall> {
        let path = Self::fid_path(fid)?;
        self.tree.lock().unwrap().unlink(path);
        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> styx::Result<FCall> {
        let path = Self::fid_path(fid)?;
        let stat = self
            .tree
            .lock()
            .unwrap()
            .stat_of(path)
            .ok_or_else(|| Error::no(errno::ENOENT))?;
        Ok(FCall::RStat { stat })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> styx::Result<FCall> {
        // Only the owning identity may change metadata, by name or by
        // the ".u" numeric id.
        if fid.uname() != "glenda" && fid.nuname() != 1000 {
            return Err(Error::no(errno::EPERM));
        }

        let path = Self::fid_path(fid)?;
        if !stat.name.is_empty() {
            let mut tree = self.tree.lock().unwrap();
            if tree.lookup(tree.nodes[&path].parent, &stat.name).is_some() {
                return Err(Error::remote("file exists", errno::EINVAL));
            }
            tree.nodes.get_mut(&path).unwrap().name = stat.name.clone();
        }
        Ok(FCall::RWStat)
    }
}

fn sample_fs() -> SynthFs {
    let fs = SynthFs::new();
    let etc = fs.add_dir(ROOT, "etc");
    fs.add_file(etc, "passwd", b"root:x:0:0\n");
    fs.add_file(ROOT, "a", b"alpha");
    fs.add_file(ROOT, "fast", b"hare");
    fs.add_file(ROOT, "slow", b"tortoise");
    fs.add_file(ROOT, "hang", b"never");
    fs
}

async fn serve(fs: SynthFs, config: SrvConfig) -> Clnt {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = dispatch(fs, server_end, config).await;
    });
    Clnt::connect(client_end, 8192, true).await.unwrap()
}

async fn mount(fs: SynthFs) -> Clnt {
    let clnt = serve(fs, SrvConfig::default()).await;
    clnt.attach(None, &StaticUser::new("glenda", 1000), "/")
        .await
        .unwrap();
    clnt
}

#[tokio::test]
async fn version_negotiation_caps_msize() {
    let clnt = serve(
        sample_fs(),
        SrvConfig {
            msize: 4096,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(clnt.msize(), 4096);
    assert!(clnt.dotu());
}

#[tokio::test]
async fn version_negotiation_dialect_fallback() {
    let clnt = serve(
        sample_fs(),
        SrvConfig {
            dotu: false,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(clnt.msize(), 8192);
    assert!(!clnt.dotu());

    clnt.attach(None, &StaticUser::new("glenda", 1000), "/")
        .await
        .unwrap();
    assert_eq!(clnt.fstat("etc/passwd").await.unwrap().name, "passwd");
}

#[tokio::test]
async fn version_is_required_first() {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = dispatch(sample_fs(), server_end, SrvConfig::default()).await;
    });
    let (mut rd, mut wr) = tokio::io::split(client_end);

    let msg = Msg {
        tag: 0,
        body: FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
            nuname: NONUNAME,
        },
    };
    wr.write_all(&serialize::pack(&msg, false).unwrap())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let reply = loop {
        match serialize::unpack(&buf, false) {
            Ok((reply, _)) => break reply,
            Err(serialize::UnpackError::NeedMore(_)) => {
                let mut chunk = [0u8; 512];
                let n = rd.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed without replying");
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => panic!("bad reply: {e}"),
        }
    };

    assert_eq!(reply.tag, 0);
    match reply.body {
        FCall::RError { ename, .. } => assert!(ename.contains("Tversion"), "got {ename:?}"),
        other => panic!("expected Rerror, got {other:?}"),
    }
}

#[tokio::test]
async fn walk_open_read() {
    let clnt = mount(sample_fs()).await;

    let fid = clnt.fopen("etc/passwd", om::READ).await.unwrap();
    assert_eq!(fid.open_mode(), Some(om::READ));
    let bytes = clnt.read(&fid, 0, 4096).await.unwrap();
    assert_eq!(bytes, b"root:x:0:0\n");

    let stat = clnt.stat(&fid).await.unwrap();
    assert_eq!(stat.name, "passwd");
    assert_eq!(stat.length, 11);
    assert_eq!(stat.uidnum, 1000);
    clnt.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn walk_missing_file_is_enoent() {
    let clnt = mount(sample_fs()).await;
    match clnt.fstat("etc/shadow").await.unwrap_err() {
        Error::Remote { errno: e, .. } => assert_eq!(e, errno::ENOENT),
        other => panic!("wrong error: {other:?}"),
    }
}

#[tokio::test]
async fn partial_walk_does_not_bind() {
    let clnt = mount(sample_fs()).await;
    assert!(clnt.fstat("etc/missing/deep").await.is_err());
    // The connection is intact and the half-walked fid was cleaned up.
    assert_eq!(clnt.fstat("etc/passwd").await.unwrap().name, "passwd");
}

#[tokio::test]
async fn clone_walk_with_zero_names() {
    let clnt = mount(sample_fs()).await;
    let root = clnt.fwalk("").await.unwrap();
    let stat = clnt.stat(&root).await.unwrap();
    assert!(stat.mode & dm::DIR != 0);
    clnt.clunk(root).await.unwrap();
}

#[tokio::test]
async fn large_readdir_returns_every_name() {
    let fs = SynthFs::new();
    let big = fs.add_dir(ROOT, "big");
    for i in 0..100 {
        fs.add_file(big, &i.to_string(), b"");
    }

    let clnt = mount(fs).await;
    let fid = clnt.fopen("big", om::READ).await.unwrap();
    let entries = clnt.read_dir(&fid).await.unwrap();

    let names: HashSet<String> = entries.into_iter().map(|s| s.name).collect();
    assert_eq!(names.len(), 100);
    for i in 0..100 {
        assert!(names.contains(&i.to_string()));
    }

    // A count too small for the next entry is refused, not truncated.
    match clnt.read(&fid, 0, 10).await.unwrap_err() {
        Error::Remote { ename, .. } => {
            assert_eq!(ename, "too small read size for dir entry")
        }
        other => panic!("wrong error: {other:?}"),
    }
    clnt.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn rename_via_wstat() {
    let clnt = mount(sample_fs()).await;
    let old = clnt.fstat("a").await.unwrap();

    let fid = clnt.fwalk("a").await.unwrap();
    clnt.rename(&fid, "b").await.unwrap();
    clnt.clunk(fid).await.unwrap();

    assert!(clnt.fstat("a").await.is_err());
    let renamed = clnt.fstat("b").await.unwrap();
    assert_eq!(renamed.qid.path, old.qid.path);
}

#[tokio::test]
async fn rename_denied_for_foreign_identity() {
    let clnt = serve(sample_fs(), SrvConfig::default()).await;
    clnt.attach(None, &StaticUser::new("mallory", 1001), "/")
        .await
        .unwrap();

    let fid = clnt.fwalk("a").await.unwrap();
    match clnt.rename(&fid, "b").await.unwrap_err() {
        Error::Remote { errno: e, .. } => assert_eq!(e, errno::EPERM),
        other => panic!("wrong error: {other:?}"),
    }
    clnt.clunk(fid).await.unwrap();

    // The file is untouched.
    assert_eq!(clnt.fstat("a").await.unwrap().name, "a");
}

#[tokio::test]
async fn client_registry_tracks_connections() {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let _ = dispatch(sample_fs(), server_end, SrvConfig::default()).await;
    });

    let clnt = Clnt::connect_with(
        client_end,
        ClntConfig {
            id: "reg-probe".to_owned(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(
        clnt::connections().iter().any(|c| c.name == "reg-probe"),
        "live connection missing from the registry"
    );

    clnt.unmount();
    assert!(
        !clnt::connections().iter().any(|c| c.name == "reg-probe"),
        "torn-down connection still registered"
    );
}

#[tokio::test]
async fn create_write_read_remove() {
    let clnt = mount(sample_fs()).await;

    let fid = clnt.fcreate("junk", 0o644, om::RDWR).await.unwrap();
    clnt.write_all(&fid, 0, b"hello, styx").await.unwrap();
    let bytes = clnt.read(&fid, 0, 64).await.unwrap();
    assert_eq!(bytes, b"hello, styx");
    assert_eq!(clnt.stat(&fid).await.unwrap().length, 11);
    clnt.clunk(fid).await.unwrap();

    clnt.fremove("junk").await.unwrap();
    assert!(clnt.fstat("junk").await.is_err());
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() {
    let clnt = mount(sample_fs()).await;
    let slow = clnt.fopen("slow", om::READ).await.unwrap();
    let fast = clnt.fopen("fast", om::READ).await.unwrap();

    let t_slow = clnt
        .rpc_begin(FCall::TRead {
            fid: slow.fid(),
            offset: 0,
            count: 64,
        })
        .await
        .unwrap();
    let t_fast = clnt
        .rpc_begin(FCall::TRead {
            fid: fast.fid(),
            offset: 0,
            count: 64,
        })
        .await
        .unwrap();
    assert_ne!(t_slow.tag(), t_fast.tag());

    // The fast reply lands first even though it was submitted second.
    let m_fast = t_fast.wait().await.unwrap();
    let m_slow = t_slow.wait().await.unwrap();

    match (m_fast.body, m_slow.body) {
        (FCall::RRead { data: f }, FCall::RRead { data: s }) => {
            assert_eq!(f.0, b"hare");
            assert_eq!(s.0, b"tortoise");
        }
        other => panic!("wrong replies: {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_requests_use_distinct_tags_and_recycle() {
    let clnt = mount(sample_fs()).await;
    let fid = clnt.fopen("slow", om::READ).await.unwrap();

    let mut txs = Vec::new();
    for _ in 0..8 {
        txs.push(
            clnt.rpc_begin(FCall::TRead {
                fid: fid.fid(),
                offset: 0,
                count: 64,
            })
            .await
            .unwrap(),
        );
    }

    let tags: HashSet<u16> = txs.iter().map(|t| t.tag()).collect();
    assert_eq!(tags.len(), 8, "in-flight tags must be pairwise distinct");
    let highest = *tags.iter().max().unwrap();

    for t in txs {
        match t.wait().await.unwrap().body {
            FCall::RRead { data } => assert_eq!(data.0, b"tortoise"),
            other => panic!("wrong reply: {other:?}"),
        }
    }

    // All eight tags are free again; a fresh request draws from the
    // bottom of the recycled range.
    let t = clnt
        .rpc_begin(FCall::TRead {
            fid: fid.fid(),
            offset: 0,
            count: 8,
        })
        .await
        .unwrap();
    assert!(t.tag() <= highest);
    t.wait().await.unwrap();
}

#[tokio::test]
async fn many_clients_share_one_connection() {
    let clnt = mount(sample_fs()).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let clnt = clnt.clone();
        handles.push(tokio::spawn(async move {
            let fid = clnt.fopen("etc/passwd", om::READ).await.unwrap();
            let bytes = clnt.read(&fid, 0, 4096).await.unwrap();
            clnt.clunk(fid).await.unwrap();
            bytes
        }));
    }

    for h in handles {
        assert_eq!(h.await.unwrap(), b"root:x:0:0\n");
    }
}

#[tokio::test]
async fn flush_abandons_a_pending_request() {
    let clnt = mount(sample_fs()).await;
    let fid = clnt.fopen("hang", om::READ).await.unwrap();

    let t = clnt
        .rpc_begin(FCall::TRead {
            fid: fid.fid(),
            offset: 0,
            count: 16,
        })
        .await
        .unwrap();
    let oldtag = t.tag();

    tokio::time::sleep(Duration::from_millis(20)).await;
    clnt.flush(oldtag).await.unwrap();
    eprintln!("DEBUG TEST: flush done, waiting on t");

    match t.wait().await.unwrap_err() {
        Error::Flushed => {}
        other => panic!("wrong error: {other:?}"),
    }

    // The connection survives and the tag space is intact.
    assert_eq!(clnt.fstat("etc/passwd").await.unwrap().name, "passwd");
}

#[tokio::test]
async fn unmount_fails_every_waiter() {
    let clnt = mount(sample_fs()).await;
    let fid = clnt.fopen("hang", om::READ).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let clnt = clnt.clone();
        let fidno = fid.fid();
        handles.push(tokio::spawn(async move {
            clnt.rpc(FCall::TRead {
                fid: fidno,
                offset: 0,
                count: 16,
            })
            .await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    clnt.unmount();

    for h in handles {
        match h.await.unwrap().unwrap_err() {
            Error::Transport(_) => {}
            other => panic!("wrong error: {other:?}"),
        }
    }

    // Latched: later calls fail immediately with the same kind of error.
    match clnt.fstat("etc/passwd").await.unwrap_err() {
        Error::Transport(_) => {}
        other => panic!("wrong error: {other:?}"),
    }
}

#[tokio::test]
async fn peer_disconnect_fails_inflight_and_latches() {
    // A pump between client and server stands in for the network; killing
    // it models the peer dropping the connection.
    let (client_end, pump_client) = tokio::io::duplex(1 << 20);
    let (pump_server, server_end) = tokio::io::duplex(1 << 20);

    tokio::spawn(async move {
        let _ = dispatch(sample_fs(), server_end, SrvConfig::default()).await;
    });
    let pump = tokio::spawn(async move {
        let (mut cr, mut cw) = tokio::io::split(pump_client);
        let (mut sr, mut sw) = tokio::io::split(pump_server);
        tokio::select! {
            _ = tokio::io::copy(&mut cr, &mut sw) => {}
            _ = tokio::io::copy(&mut sr, &mut cw) => {}
        }
    });

    let clnt = Clnt::connect(client_end, 8192, true).await.unwrap();
    clnt.attach(None, &StaticUser::new("glenda", 1000), "/")
        .await
        .unwrap();
    let fid = clnt.fopen("hang", om::READ).await.unwrap();

    let reader = {
        let clnt = clnt.clone();
        let fidno = fid.fid();
        tokio::spawn(async move {
            clnt.rpc(FCall::TRead {
                fid: fidno,
                offset: 0,
                count: 16,
            })
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    pump.abort();

    match reader.await.unwrap().unwrap_err() {
        Error::Transport(_) => {}
        other => panic!("wrong error: {other:?}"),
    }
    match clnt.fstat("etc/passwd").await.unwrap_err() {
        Error::Transport(_) => {}
        other => panic!("wrong error: {other:?}"),
    }
}
