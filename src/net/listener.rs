//! Listening sockets, freshly bound or inherited.
//!
//! # Responsibilities
//! - Bind every configured address on first launch
//! - Adopt inherited descriptors at their table offsets after a restart
//! - Verify each inherited descriptor before trusting it
//! - Hand out serving copies and expose descriptors for the next handoff
//! - Close the process's copies during drain
//!
//! # Design Decisions
//! - Address order is fixed at open time and never changes afterwards
//! - The set keeps its own copy of every socket; the engine serves from a
//!   duplicate, so stopping the engine never closes the inheritable copy
//! - Descriptors stay close-on-exec; only the restart spawn places them

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Mutex, PoisonError};

use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::fd_table::{fd_for_offset, FdOffsetTable};

/// One open listening socket.
#[derive(Debug)]
pub struct BoundListener {
    /// Address as configured (`:8080`, `127.0.0.1:4343`, ...).
    pub addr: String,
    /// Address the socket is actually bound to.
    pub local_addr: SocketAddr,
    /// Whether the socket came from the parent process.
    pub inherited: bool,
    socket: TcpListener,
}

/// Ordered set of listening sockets owned by this process generation.
#[derive(Debug)]
pub struct ListenerSet {
    entries: Mutex<Vec<BoundListener>>,
}

impl ListenerSet {
    /// Open listeners for `table`, inheriting or binding fresh.
    pub fn open(table: &FdOffsetTable, inherited: bool) -> Result<Self, LifecycleError> {
        if inherited {
            Self::inherit(table)
        } else {
            Self::bind(&table.addrs())
        }
    }

    /// Bind every address, in order.
    pub fn bind<S: AsRef<str>>(addrs: &[S]) -> Result<Self, LifecycleError> {
        let mut entries = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let addr = addr.as_ref();
            let socket = TcpListener::bind(normalize_addr(addr)).map_err(|source| {
                LifecycleError::Bind {
                    addr: addr.to_string(),
                    source,
                }
            })?;
            let local_addr = socket.local_addr().map_err(|source| LifecycleError::Bind {
                addr: addr.to_string(),
                source,
            })?;

            tracing::info!(address = %addr, local_addr = %local_addr, "Listener bound");
            entries.push(BoundListener {
                addr: addr.to_string(),
                local_addr,
                inherited: false,
                socket,
            });
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Adopt the descriptors a parent placed at the table's offsets.
    pub fn inherit(table: &FdOffsetTable) -> Result<Self, LifecycleError> {
        let mut entries = Vec::with_capacity(table.len());
        for (addr, offset) in table.iter() {
            entries.push(adopt_listener(addr, fd_for_offset(offset))?);
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Non-blocking duplicates for the engine, in address order.
    pub fn serving_copies(&self) -> std::io::Result<Vec<(String, TcpListener)>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|entry| {
                let copy = entry.socket.try_clone()?;
                copy.set_nonblocking(true)?;
                Ok((entry.addr.clone(), copy))
            })
            .collect()
    }

    /// Run `f` with the addresses and their descriptors, in address order.
    ///
    /// The set cannot be closed while `f` runs, so the descriptors stay valid.
    pub fn with_descriptors<R>(&self, f: impl FnOnce(&[String], &[RawFd]) -> R) -> R {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let addrs: Vec<String> = entries.iter().map(|e| e.addr.clone()).collect();
        let fds: Vec<RawFd> = entries.iter().map(|e| e.socket.as_raw_fd()).collect();
        f(&addrs, &fds)
    }

    pub fn addrs(&self) -> Vec<String> {
        self.with_descriptors(|addrs, _| addrs.to_vec())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|e| e.local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close this process's copies. Returns the errors `close(2)` reported.
    pub fn close(&self) -> Vec<LifecycleError> {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner));
        let mut errors = Vec::new();
        for entry in entries {
            let fd = entry.socket.into_raw_fd();
            // SAFETY: `fd` was just released from its owner and is closed exactly once.
            if unsafe { libc::close(fd) } != 0 {
                errors.push(LifecycleError::ListenerClose(std::io::Error::last_os_error()));
            } else {
                tracing::debug!(address = %entry.addr, "Listener closed");
            }
        }
        errors
    }
}

/// `:8080` means every IPv4 interface.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Port component of an address, if it has a numeric one.
pub fn expected_port(addr: &str) -> Option<u16> {
    addr.rsplit(':').next()?.parse().ok()
}

/// Adopt `fd` as the listener for `addr` and check it is bound where `addr` says.
fn adopt_listener(addr: &str, fd: RawFd) -> Result<BoundListener, LifecycleError> {
    let socket = adopt_descriptor(addr, fd)?;
    let local_addr = socket.local_addr().map_err(|e| LifecycleError::Inherit {
        addr: addr.to_string(),
        fd,
        reason: e.to_string(),
    })?;

    if let Some(port) = expected_port(addr) {
        if port != 0 && port != local_addr.port() {
            return Err(LifecycleError::Inherit {
                addr: addr.to_string(),
                fd,
                reason: format!("socket is bound to {}", local_addr),
            });
        }
    }

    tracing::info!(address = %addr, fd, local_addr = %local_addr, "Listener inherited");
    Ok(BoundListener {
        addr: addr.to_string(),
        local_addr,
        inherited: true,
        socket,
    })
}

fn adopt_descriptor(addr: &str, fd: RawFd) -> Result<TcpListener, LifecycleError> {
    let unusable = |reason: &str| LifecycleError::Inherit {
        addr: addr.to_string(),
        fd,
        reason: reason.to_string(),
    };

    // SAFETY: F_GETFD only inspects the descriptor table.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(unusable("descriptor is not open"));
    }
    if !is_listening_socket(fd) {
        return Err(unusable("descriptor is not a listening socket"));
    }

    // Inherited sockets must not leak into unrelated children.
    // SAFETY: fd is open (checked above); F_SETFD only changes its flags.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(unusable("cannot set close-on-exec"));
    }

    // SAFETY: the descriptor is open, is a listening socket, and the parent
    // placed it at this slot for us alone; nothing else in the process owns it.
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn is_listening_socket(fd: RawFd) -> bool {
    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: both out-pointers reference live locals of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut accepting as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    rc == 0 && accepting != 0
}
