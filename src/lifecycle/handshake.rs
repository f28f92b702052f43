//! Parent to child restart handshake.
//!
//! The handshake is a one-shot message carried in the child's environment:
//!
//! ```text
//! GEM_GRACEFUL_RESTART=true
//! GEM_SERVER_ADDRS=:8080,:4343,:6060
//! ```
//!
//! The address order is the descriptor order (see `fd_table`). The parent
//! writes it once when spawning, the child reads it once at startup.

use std::ffi::{OsStr, OsString};

use crate::lifecycle::fd_table::FdOffsetTable;

/// Marker telling a process it was spawned to take over listeners.
pub const GRACEFUL_RESTART_ENV: &str = "GEM_GRACEFUL_RESTART";
/// Comma-joined, ordered listen addresses.
pub const SERVER_ADDRS_ENV: &str = "GEM_SERVER_ADDRS";

const MARKER_VALUE: &str = "true";

/// Decoded handshake state of the current process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// True when this process must open its listeners from inherited descriptors.
    pub graceful_restart: bool,
    /// Inherited listen addresses in descriptor order. Empty on fresh launch.
    pub addrs: Vec<String>,
}

impl Handshake {
    /// Read the handshake from an environment.
    ///
    /// A missing marker, or any value other than `true`, means fresh launch,
    /// whatever `GEM_SERVER_ADDRS` says.
    pub fn detect<I, K, V>(env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let mut marker = None;
        let mut addrs = None;
        for (key, value) in env {
            let key = key.as_ref();
            if key == GRACEFUL_RESTART_ENV {
                marker = Some(value.as_ref().to_os_string());
            } else if key == SERVER_ADDRS_ENV {
                addrs = Some(value.as_ref().to_string_lossy().into_owned());
            }
        }

        let graceful_restart = marker.as_deref() == Some(OsStr::new(MARKER_VALUE));
        if !graceful_restart {
            return Self::default();
        }

        Self {
            graceful_restart,
            addrs: addrs.as_deref().map(split_addrs).unwrap_or_default(),
        }
    }

    /// Read the handshake from this process's environment.
    pub fn from_process_env() -> Self {
        Self::detect(std::env::vars_os())
    }

    /// The two entries a child must receive.
    pub fn child_entries<S: AsRef<str>>(addrs: &[S]) -> [(&'static str, String); 2] {
        [
            (GRACEFUL_RESTART_ENV, MARKER_VALUE.to_string()),
            (SERVER_ADDRS_ENV, join_addrs(addrs)),
        ]
    }
}

/// Copy `base` and append the handshake entries.
///
/// Entries already present under the handshake keys (this process may itself
/// be a restarted child) are replaced, not duplicated.
pub fn build_child_environment<I, K, V, S>(base: I, addrs: &[S]) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
    S: AsRef<str>,
{
    let mut env: Vec<(OsString, OsString)> = base
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| k != GRACEFUL_RESTART_ENV && k != SERVER_ADDRS_ENV)
        .collect();

    for (key, value) in Handshake::child_entries(addrs) {
        env.push((key.into(), value.into()));
    }
    env
}

/// Offset table from `GEM_SERVER_ADDRS` in the given environment.
pub fn inherited_offset_table<I, K, V>(env: I) -> FdOffsetTable
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let addrs = env
        .into_iter()
        .find(|(k, _)| k.as_ref() == SERVER_ADDRS_ENV)
        .map(|(_, v)| split_addrs(&v.as_ref().to_string_lossy()))
        .unwrap_or_default();
    FdOffsetTable::build(&addrs)
}

/// Join addresses preserving order.
pub fn join_addrs<S: AsRef<str>>(addrs: &[S]) -> String {
    addrs
        .iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a comma-joined address list preserving order.
pub fn split_addrs(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(env: &[(OsString, OsString)]) -> Vec<String> {
        env.iter()
            .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
            .collect()
    }

    #[test]
    fn child_environment_appends_marker_and_addrs() {
        let base: Vec<(String, String)> = Vec::new();
        let env = build_child_environment(base, &[":8080", ":8081"]);
        assert_eq!(
            entries(&env),
            vec!["GEM_GRACEFUL_RESTART=true", "GEM_SERVER_ADDRS=:8080,:8081"]
        );
    }

    #[test]
    fn child_environment_replaces_previous_handshake() {
        let base = vec![
            ("PATH", "/usr/bin"),
            (GRACEFUL_RESTART_ENV, "true"),
            (SERVER_ADDRS_ENV, ":8080,:8081"),
        ];
        let env = build_child_environment(base, &[":8081", ":8080"]);
        assert_eq!(
            entries(&env),
            vec![
                "PATH=/usr/bin",
                "GEM_GRACEFUL_RESTART=true",
                "GEM_SERVER_ADDRS=:8081,:8080"
            ]
        );
    }

    #[test]
    fn order_round_trips() {
        let addrs = vec![":8080".to_string(), ":4343".to_string(), ":6060".to_string()];
        let env = build_child_environment(Vec::<(String, String)>::new(), &addrs);
        assert_eq!(entries(&env)[1], "GEM_SERVER_ADDRS=:8080,:4343,:6060");

        let reversed: Vec<_> = addrs.iter().rev().cloned().collect();
        let env_rev = build_child_environment(Vec::<(String, String)>::new(), &reversed);
        assert_eq!(entries(&env_rev)[1], "GEM_SERVER_ADDRS=:6060,:4343,:8080");

        let detected = Handshake::detect(env);
        assert!(detected.graceful_restart);
        assert_eq!(detected.addrs, addrs);

        let table = FdOffsetTable::build(&detected.addrs);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(table.offset(addr), Some(i));
        }
    }

    #[test]
    fn missing_or_falsy_marker_is_fresh_launch() {
        let stray = vec![(SERVER_ADDRS_ENV, ":8080")];
        assert_eq!(Handshake::detect(stray), Handshake::default());

        let falsy = vec![(GRACEFUL_RESTART_ENV, "1"), (SERVER_ADDRS_ENV, ":8080")];
        assert!(!Handshake::detect(falsy).graceful_restart);
    }

    #[test]
    fn offset_table_from_env() {
        let env = vec![(SERVER_ADDRS_ENV, ":8080,:4343,:6060")];
        let table = inherited_offset_table(env);
        assert_eq!(table.len(), 3);
        assert_eq!(table.offset(":8080"), Some(0));
        assert_eq!(table.offset(":4343"), Some(1));
        assert_eq!(table.offset(":6060"), Some(2));
    }
}
