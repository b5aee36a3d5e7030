//! A null/zero pseudo-filesystem served over 9P.
//!
//! Exports a flat root holding `null` (reads empty, swallows writes),
//! `zero` (reads zero-filled), and `noaccess` (refuses to open). Handy
//! as a benchmark target and as the smallest useful back-end.

use {
    async_trait::async_trait,
    clap::Parser,
    styx::{
        srv::{FId, Filesystem, SrvConfig, dir_read_chunk, srv_async_with},
        *,
    },
};

const QROOT: u64 = 'r' as u64;
const QNULL: u64 = 'n' as u64;
const QZERO: u64 = 'z' as u64;
const QNOACCESS: u64 = 'N' as u64;

const FILES: [u64; 3] = [QNULL, QZERO, QNOACCESS];

fn qid_of(path: u64) -> QId {
    QId {
        typ: if path == QROOT {
            QIdType::DIR
        } else {
            QIdType::FILE
        },
        version: 0,
        path,
    }
}

fn stat_of(path: u64) -> Stat {
    let (name, mode) = match path {
        QROOT => (".", dm::DIR | 0o555),
        QNULL => ("null", 0o666),
        QZERO => ("zero", 0o444),
        _ => ("noaccess", 0),
    };

    Stat {
        typ: 0,
        dev: 0,
        qid: qid_of(path),
        mode,
        atime: 0,
        mtime: 0,
        length: 0,
        name: name.to_owned(),
        uid: "root".to_owned(),
        gid: "root".to_owned(),
        muid: "root".to_owned(),
        ext: String::new(),
        uidnum: 0,
        gidnum: 0,
        muidnum: 0,
    }
}

fn root_listing(dotu: bool) -> Result<Vec<u8>> {
    let mut packed = Vec::new();
    for path in FILES {
        packed.extend(serialize::pack_stat(&stat_of(path), dotu)?);
    }
    Ok(packed)
}

#[derive(Clone)]
struct NullFs;

#[async_trait]
impl Filesystem for NullFs {
    type FId = ();

    async fn rattach(
        &self,
        _fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _nuname: u32,
    ) -> Result<FCall> {
        Ok(FCall::RAttach {
            qid: qid_of(QROOT),
        })
    }

    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        if wnames.is_empty() {
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }
        // Flat tree: anything deeper than one step cannot resolve.
        if wnames.len() > 1 {
            return Err(Error::no(errno::ENOENT));
        }

        let qid = match wnames[0].as_str() {
            "." => qid_of(QROOT),
            "null" => qid_of(QNULL),
            "zero" => qid_of(QZERO),
            "noaccess" => qid_of(QNOACCESS),
            _ => return Err(Error::no(errno::ENOENT)),
        };
        Ok(FCall::RWalk { wqids: vec![qid] })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        let qid = fid
            .qid()
            .ok_or_else(|| Error::remote("unknown fid", errno::EINVAL))?;

        let writable = qid.path == QNULL;
        match qid.path {
            QNOACCESS => return Err(Error::no(errno::EPERM)),
            _ if !writable && matches!(mode & 3, om::WRITE | om::RDWR) => {
                return Err(Error::no(errno::EPERM));
            }
            _ => {}
        }

        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let qid = fid
            .qid()
            .ok_or_else(|| Error::remote("unknown fid", errno::EINVAL))?;

        let data = match qid.path {
            QROOT => {
                let packed = root_listing(fid.dotu())?;
                dir_read_chunk(&packed, offset, count)?.to_vec()
            }
            QZERO => vec![0; count as usize],
            _ => Vec::new(),
        };

        Ok(FCall::RRead { data: Data(data) })
    }

    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, data: &Data) -> Result<FCall> {
        Ok(FCall::RWrite {
            count: data.0.len() as u32,
        })
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let qid = fid
            .qid()
            .ok_or_else(|| Error::remote("unknown fid", errno::EINVAL))?;
        Ok(FCall::RStat {
            stat: stat_of(qid.path),
        })
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!127.0.0.1!564")]
    address: String,

    /// Largest message size to grant in version negotiation
    #[arg(long, default_value_t = MSIZE_DEFAULT)]
    msize: u32,

    /// Refuse the ".u" dialect
    #[arg(long)]
    no_dotu: bool,

    /// Debug bits: 1 print fcalls, 2 print packets, 4 ring fcalls, 8 ring packets
    #[arg(long, default_value_t = 0)]
    debug: u32,

    /// Server id used in debug output
    #[arg(long, default_value = "nullfs")]
    id: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = SrvConfig {
        msize: cli.msize,
        dotu: !cli.no_dotu,
        debug: DebugFlags::from_bits_truncate(cli.debug),
        id: cli.id,
    };

    println!("[*] Ready to accept clients: {}", cli.address);
    if let Err(e) = srv_async_with(NullFs, &cli.address, config).await {
        eprintln!("Error: {e:?}");
        std::process::exit(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_parses_back() {
        let packed = root_listing(true).unwrap();
        let mut cur = std::io::Cursor::new(&packed[..]);
        let mut names = Vec::new();
        while (cur.position() as usize) < packed.len() {
            names.push(serialize::read_stat(&mut cur, true).unwrap().name);
        }
        assert_eq!(names, ["null", "zero", "noaccess"]);
    }

    #[test]
    fn listing_refuses_tiny_reads() {
        let packed = root_listing(false).unwrap();
        assert!(dir_read_chunk(&packed, 0, 4).is_err());
        assert!(dir_read_chunk(&packed, 0, 4096).is_ok());
    }
}
