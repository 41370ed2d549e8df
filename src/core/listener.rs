// src/core/listener.rs

//! Listener descriptors and the listening subsystem that binds them.
//!
//! A listener's descriptor is shared between consecutive cycles while an
//! inherited socket is handed over, so it is held as an `Arc<OwnedFd>`:
//! the kernel socket closes when the last cycle holding it lets go.

use crate::config::ListenConf;
use crate::core::errors::CycleError;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A bound-or-to-be-bound listening socket description.
#[derive(Debug, Clone)]
pub struct Listener {
    pub addr: SocketAddr,
    /// Display form of the address, for logging.
    pub addr_text: String,
    /// `None` until the socket is opened or inherited.
    pub fd: Option<Arc<OwnedFd>>,
    /// Must be freshly opened by the listening subsystem.
    pub open: bool,
    /// Inherited into the successor cycle; do not close on retirement.
    pub remain: bool,
    /// Never offered for inheritance.
    pub ignore: bool,
    pub backlog: i32,
    pub deferred_accept: bool,
    pub accept_filter: Option<String>,
    pub add_deferred: bool,
    pub delete_deferred: bool,
    pub post_accept_timeout: Duration,
}

impl Listener {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            addr_text: addr.to_string(),
            fd: None,
            open: false,
            remain: false,
            ignore: false,
            backlog: 511,
            deferred_accept: false,
            accept_filter: None,
            add_deferred: false,
            delete_deferred: false,
            post_accept_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_conf(lc: &ListenConf) -> Self {
        Self {
            backlog: lc.backlog,
            deferred_accept: lc.deferred_accept,
            accept_filter: lc.accept_filter.clone(),
            post_accept_timeout: lc.post_accept_timeout,
            ..Self::new(lc.addr)
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }
}

/// Binds and listens every listener whose `open` flag is set.
///
/// An address that is still in use is retried for a few passes with a
/// short delay, which covers the window where a previous generation's
/// socket has not finished closing. Any other error aborts.
pub fn open_listening_sockets(listeners: &mut [Listener]) -> Result<(), CycleError> {
    for attempt in 1..=BIND_ATTEMPTS {
        let mut again = false;

        for ls in listeners.iter_mut() {
            if !ls.open || ls.fd.is_some() {
                continue;
            }

            match bind_and_listen(&ls.addr, ls.backlog) {
                Ok(fd) => {
                    debug!("listening on {} (fd {})", ls.addr_text, fd.as_raw_fd());
                    ls.fd = Some(Arc::new(fd));
                }
                Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                    warn!(
                        "bind() to {} failed ({}), trying again after {:?}",
                        ls.addr_text, e, BIND_RETRY_DELAY
                    );
                    again = true;
                }
                Err(e) => {
                    error!("bind() to {} failed: {}", ls.addr_text, e);
                    return Err(CycleError::Listen {
                        addr: ls.addr_text.clone(),
                        source: e,
                    });
                }
            }
        }

        if !again {
            return Ok(());
        }
        if attempt < BIND_ATTEMPTS {
            std::thread::sleep(BIND_RETRY_DELAY);
        }
    }

    let stuck = listeners
        .iter()
        .find(|ls| ls.open && ls.fd.is_none())
        .map(|ls| ls.addr_text.clone())
        .unwrap_or_default();
    error!("still could not bind() to {stuck}");
    Err(CycleError::Listen {
        addr: stuck,
        source: io::Error::from_raw_os_error(libc::EADDRINUSE),
    })
}

fn bind_and_listen(addr: &SocketAddr, backlog: i32) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    let (storage, len) = sockaddr_from(addr);
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::listen(fd.as_raw_fd(), backlog) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Applies pending deferred-accept changes to every listener's socket.
///
/// Failures are logged and skipped: an inherited socket keeps behaving the
/// way it already did, which is acceptable.
pub fn apply_deferred_accept(listeners: &mut [Listener]) {
    #[cfg(target_os = "freebsd")]
    apply_accept_filter(listeners);

    #[cfg(target_os = "linux")]
    for ls in listeners.iter_mut() {
        if !ls.add_deferred && !ls.delete_deferred {
            continue;
        }
        let Some(fd) = &ls.fd else {
            continue;
        };

        let timeout: libc::c_int = if ls.add_deferred {
            ls.post_accept_timeout.as_secs().min(libc::c_int::MAX as u64) as libc::c_int
        } else {
            0
        };

        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_DEFER_ACCEPT,
                &timeout as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            warn!(
                "setsockopt(TCP_DEFER_ACCEPT, {}) for {} failed, ignored: {}",
                timeout,
                ls.addr_text,
                io::Error::last_os_error()
            );
            continue;
        }

        ls.deferred_accept = ls.add_deferred;
    }
}

#[cfg(target_os = "freebsd")]
fn apply_accept_filter(listeners: &mut [Listener]) {
    for ls in listeners.iter_mut() {
        let Some(fd) = &ls.fd else {
            continue;
        };

        if ls.delete_deferred {
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ACCEPTFILTER,
                    std::ptr::null(),
                    0,
                )
            };
            if rc == -1 {
                warn!(
                    "setsockopt(SO_ACCEPTFILTER, NULL) for {} failed, ignored: {}",
                    ls.addr_text,
                    io::Error::last_os_error()
                );
                continue;
            }
            ls.deferred_accept = false;
        }

        if ls.add_deferred {
            let Some(name) = &ls.accept_filter else {
                continue;
            };
            let mut af: libc::accept_filter_arg = unsafe { mem::zeroed() };
            for (dst, src) in af.af_name.iter_mut().zip(name.bytes().take(15)) {
                *dst = src as libc::c_char;
            }
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ACCEPTFILTER,
                    &af as *const _ as *const libc::c_void,
                    mem::size_of::<libc::accept_filter_arg>() as libc::socklen_t,
                )
            };
            if rc == -1 {
                warn!(
                    "setsockopt(SO_ACCEPTFILTER, \"{}\") for {} failed, ignored: {}",
                    name,
                    ls.addr_text,
                    io::Error::last_os_error()
                );
                continue;
            }
            ls.deferred_accept = true;
        }
    }
}
