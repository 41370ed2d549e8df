// src/core/inherit.rs

//! The listener inherit/diff engine.
//!
//! Pairs the old and new cycles' listener sets by address, transfers live
//! descriptors to matching new listeners, and marks which new listeners
//! still need to be opened and which option changes have to be applied to
//! sockets that were handed over.

use crate::core::listener::Listener;
use std::net::SocketAddr;
use tracing::debug;

/// Two listeners match when their addresses are equal at the transport
/// level; both IPv4 and IPv6 addresses participate.
pub fn sockaddr_eq(a: &SocketAddr, b: &SocketAddr) -> bool {
    a == b
}

/// Diffs `new` against `old`.
///
/// On a match the old descriptor is transferred and `remain` is set on
/// both sides, so retirement of the old cycle leaves the socket alone.
/// Unmatched new listeners are flagged `open`; unmatched old listeners
/// keep `remain == false` and are closed when the old cycle is released.
pub fn inherit_listeners(old: &mut [Listener], new: &mut [Listener]) {
    if old.is_empty() {
        for nls in new.iter_mut() {
            nls.open = true;
            if nls.accept_filter.is_some() || nls.deferred_accept {
                nls.add_deferred = true;
            }
        }
        return;
    }

    for ols in old.iter_mut() {
        ols.remain = false;
    }

    for nls in new.iter_mut() {
        for ols in old.iter_mut() {
            if ols.ignore {
                continue;
            }
            if !sockaddr_eq(&nls.addr, &ols.addr) {
                continue;
            }

            nls.fd = ols.fd.clone();
            nls.remain = true;
            ols.remain = true;
            debug!("inheriting listener {} from previous cycle", nls.addr_text);

            reconcile_accept_options(ols, nls);
            break;
        }

        if nls.fd.is_none() {
            nls.open = true;
        }
    }
}

/// Computes the option changes an inherited socket needs: accept-filter
/// replacement and TCP-level deferred-accept transitions. The actual
/// socket calls happen later and are non-fatal.
fn reconcile_accept_options(old: &Listener, new: &mut Listener) {
    match (&old.accept_filter, &new.accept_filter) {
        (Some(old_af), Some(new_af)) => {
            if old_af != new_af {
                new.delete_deferred = true;
                new.add_deferred = true;
            }
        }
        (Some(_), None) => new.delete_deferred = true,
        (None, Some(_)) => new.add_deferred = true,
        (None, None) => {}
    }

    if old.deferred_accept && !new.deferred_accept {
        new.delete_deferred = true;
    } else if !old.deferred_accept && new.deferred_accept {
        new.add_deferred = true;
    }
}
