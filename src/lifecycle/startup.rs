//! Startup orchestration.
//!
//! # Responsibilities
//! - Decide whether this process is a fresh launch or a restarted child
//! - Pick the authoritative address list (configured or inherited)
//! - Build the descriptor table and open listeners accordingly
//! - Tell the parent we took over, once serving
//!
//! # Design Decisions
//! - Fail fast: any listener that cannot be opened is fatal
//! - A restarted child never binds; the parent still owns the ports
//! - Readiness is only signalled after every listener is serving

use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;

use uuid::Uuid;

use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::fd_table::{FdOffsetTable, FIRST_INHERITED_FD};
use crate::lifecycle::handshake::Handshake;
use crate::net::ListenerSet;

/// Identity of this process generation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Random per-process id for log correlation.
    pub id: Uuid,
    pub pid: u32,
    pub name: String,
    /// Set once at startup, never changes.
    pub graceful_restart: bool,
    /// Addresses served, in descriptor order.
    pub addrs: Vec<String>,
}

impl Generation {
    pub fn new(name: impl Into<String>, graceful_restart: bool, addrs: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id(),
            name: name.into(),
            graceful_restart,
            addrs,
        }
    }
}

/// Everything startup produced.
#[derive(Debug)]
pub struct Prepared {
    pub generation: Generation,
    pub table: FdOffsetTable,
    pub listeners: ListenerSet,
}

/// Open the listeners this process must serve.
pub fn prepare(
    name: &str,
    configured: &[String],
    handshake: &Handshake,
) -> Result<Prepared, LifecycleError> {
    let addrs = if handshake.graceful_restart {
        if handshake.addrs.is_empty() {
            return Err(LifecycleError::Inherit {
                addr: String::new(),
                fd: FIRST_INHERITED_FD,
                reason: "restart marker present but no addresses were passed".to_string(),
            });
        }
        if handshake.addrs != configured {
            tracing::warn!(
                inherited = ?handshake.addrs,
                configured = ?configured,
                "Inherited addresses differ from configuration, serving inherited ones"
            );
        }
        handshake.addrs.clone()
    } else {
        configured.to_vec()
    };

    let table = FdOffsetTable::build(&addrs);
    let listeners = ListenerSet::open(&table, handshake.graceful_restart)?;
    let generation = Generation::new(name, handshake.graceful_restart, addrs);

    tracing::info!(
        generation = %generation.id,
        pid = generation.pid,
        graceful_restart = generation.graceful_restart,
        addrs = ?generation.addrs,
        "Listeners ready"
    );

    Ok(Prepared {
        generation,
        table,
        listeners,
    })
}

/// Write the readiness byte to the parent's pipe, if there is one.
///
/// Returns whether the parent was notified.
pub fn notify_parent_ready(table: &FdOffsetTable) -> bool {
    let fd = table.readiness_fd();

    // SAFETY: `stat` is plain data, fully written by fstat on success.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat only reads the descriptor table and writes into `stat`.
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc != 0 || (stat.st_mode & libc::S_IFMT) != libc::S_IFIFO {
        tracing::warn!(fd, "No readiness pipe from parent");
        return false;
    }

    // SAFETY: the parent placed the pipe's write end at this slot for us;
    // it is owned by nothing else and gets closed when `pipe` drops.
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    match pipe.write_all(b"1") {
        Ok(()) => {
            tracing::info!("Parent notified of readiness");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to notify parent");
            false
        }
    }
}
