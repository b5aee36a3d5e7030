use crate::error;
use crate::fcall::{DebugFlags, Msg};
use log::{debug, trace};

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string of the form `proto!address!port` (tcp) or
/// `proto!path` (unix) into the protocol and the address to hand to
/// the socket layer.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;

    match proto {
        "tcp" => {
            let (addr, port) = (split.next()?, split.next()?);
            Some((proto, format!("{addr}:{port}")))
        }
        "unix" => Some((proto, split.next()?.to_owned())),
        _ => None,
    }
}

/// Emit a decoded fcall on the log facade when the debug flags ask for it.
///
/// `dir` is `'<'` for incoming messages and `'>'` for outgoing ones,
/// matching the arrows the origin printed.
pub(crate) fn trace_fcall(flags: DebugFlags, id: &str, dir: char, msg: &Msg) {
    if flags.contains(DebugFlags::PRINT_FCALLS) {
        debug!(target: "styx::fcall", "{dir} {id} {msg:?}");
    }
    if flags.contains(DebugFlags::LOG_FCALLS) {
        trace!(target: "styx::fcall", "{dir} {id} {msg:?}");
    }
}

/// Emit a raw packet on the log facade when the debug flags ask for it.
pub(crate) fn trace_packet(flags: DebugFlags, id: &str, dir: char, pkt: &[u8]) {
    if flags.contains(DebugFlags::PRINT_PACKETS) {
        debug!(target: "styx::packet", "{dir} {id} {pkt:?}");
    }
    if flags.contains(DebugFlags::LOG_PACKETS) {
        trace!(target: "styx::packet", "{dir} {id} {pkt:?}");
    }
}
