//! Identity attached to fids at attach/auth time.
//!
//! The protocol only ever sees a user name and, in ".u" mode, a numeric
//! id; how those are resolved is somebody else's business. This module
//! defines the contract plus an OS-backed resolver for the common case.

use crate::fcall::NONUNAME;
use crate::{io_err, res};

/// An identity a connection attaches as.
pub trait User: Send + Sync {
    /// The user name sent in `uname`.
    fn name(&self) -> &str;

    /// The numeric id sent in `nuname` on ".u" connections,
    /// [`NONUNAME`] when there is none.
    fn id(&self) -> u32 {
        NONUNAME
    }
}

/// A fixed name/id pair.
#[derive(Clone, Debug)]
pub struct StaticUser {
    name: String,
    id: u32,
}

impl StaticUser {
    pub fn new(name: impl Into<String>, id: u32) -> StaticUser {
        StaticUser {
            name: name.into(),
            id,
        }
    }
}

impl User for StaticUser {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }
}

/// Resolver against the operating system's user database.
pub struct OsUsers;

impl OsUsers {
    /// The identity of the calling process, by effective uid.
    pub fn current() -> std::io::Result<StaticUser> {
        let uid = nix::unistd::geteuid();
        match nix::unistd::User::from_uid(uid) {
            Ok(Some(user)) => Ok(StaticUser::new(user.name, uid.as_raw())),
            Ok(None) => res!(io_err!(NotFound, "no passwd entry for effective uid")),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_user_reports_both_fields() {
        let u = StaticUser::new("glenda", 1000);
        assert_eq!(u.name(), "glenda");
        assert_eq!(u.id(), 1000);
    }

    #[test]
    fn current_user_has_a_name() {
        let u = OsUsers::current().unwrap();
        assert!(!u.name().is_empty());
    }
}
