//! OS signal handling.
//!
//! # Responsibilities
//! - Map signals to lifecycle actions (restart, ignore)
//! - Keep the reserved termination signal hard-wired to "stop"
//! - Install OS-level handlers as signals get registered
//! - Forward delivered signals to the async lifecycle loop
//!
//! # Design Decisions
//! - Uses signal-hook's self-pipe iterator on a dedicated thread; the
//!   thread only forwards the signal number over a channel, all real work
//!   happens on the runtime
//! - A single mutex guards both the action table and handler installation,
//!   so concurrent registrations never interleave
//! - Actions are resolved at delivery time, last registration wins

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::thread;

use signal_hook::iterator::{Handle, Signals};
use tokio::sync::mpsc;

use crate::lifecycle::error::LifecycleError;

/// Signals that can never be remapped. Delivery always means "stop now".
pub const RESERVED_SIGNALS: &[Signal] = &[Signal::TERM];

const SIGNAL_NAMES: &[(i32, &str)] = &[
    (libc::SIGHUP, "SIGHUP"),
    (libc::SIGINT, "SIGINT"),
    (libc::SIGQUIT, "SIGQUIT"),
    (libc::SIGUSR1, "SIGUSR1"),
    (libc::SIGUSR2, "SIGUSR2"),
    (libc::SIGPIPE, "SIGPIPE"),
    (libc::SIGALRM, "SIGALRM"),
    (libc::SIGTERM, "SIGTERM"),
    (libc::SIGCHLD, "SIGCHLD"),
    (libc::SIGCONT, "SIGCONT"),
    (libc::SIGTSTP, "SIGTSTP"),
    (libc::SIGTTIN, "SIGTTIN"),
    (libc::SIGTTOU, "SIGTTOU"),
    (libc::SIGWINCH, "SIGWINCH"),
];

/// An operating-system signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(i32);

impl Signal {
    pub const HUP: Signal = Signal(libc::SIGHUP);
    pub const INT: Signal = Signal(libc::SIGINT);
    pub const QUIT: Signal = Signal(libc::SIGQUIT);
    pub const USR1: Signal = Signal(libc::SIGUSR1);
    pub const USR2: Signal = Signal(libc::SIGUSR2);
    pub const TERM: Signal = Signal(libc::SIGTERM);

    /// Wrap a raw signal number.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw signal number.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Conventional name, e.g. `SIGHUP`, if known.
    pub fn name(self) -> Option<&'static str> {
        SIGNAL_NAMES
            .iter()
            .find(|(raw, _)| *raw == self.0)
            .map(|(_, name)| *name)
    }

    /// Whether the signal belongs to the reserved set.
    pub fn is_reserved(self) -> bool {
        RESERVED_SIGNALS.contains(&self)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "signal {}", self.0),
        }
    }
}

impl FromStr for Signal {
    type Err = String;

    /// Accepts `SIGHUP`, `hup` or a bare number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(raw) = s.parse::<i32>() {
            return Ok(Signal(raw));
        }

        let upper = s.to_ascii_uppercase();
        let wanted = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };

        SIGNAL_NAMES
            .iter()
            .find(|(_, name)| *name == wanted)
            .map(|(raw, _)| Signal(*raw))
            .ok_or_else(|| format!("unknown signal {:?}", s))
    }
}

/// Lifecycle action bound to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalAction {
    /// Hand the listeners to a freshly spawned process, then drain.
    Restart,
    /// Swallow the signal.
    Ignore,
}

impl SignalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalAction::Restart => "restart",
            SignalAction::Ignore => "ignore",
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for SignalAction {
    type Error = LifecycleError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SignalAction::Restart),
            1 => Ok(SignalAction::Ignore),
            other => Err(LifecycleError::InvalidAction(other.to_string())),
        }
    }
}

impl TryFrom<&str> for SignalAction {
    type Error = LifecycleError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for SignalAction {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(SignalAction::Restart),
            "ignore" => Ok(SignalAction::Ignore),
            _ => Err(LifecycleError::InvalidAction(s.to_string())),
        }
    }
}

/// What the lifecycle loop should do with a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Reserved signal: stop without handoff.
    Stop,
    Restart,
    Ignore,
}

/// Process-wide table of signal actions.
///
/// Owned by the server instance. Delivered signals arrive on the receiver
/// returned by [`SignalRegistry::install`].
pub struct SignalRegistry {
    actions: Mutex<HashMap<Signal, SignalAction>>,
    handle: Handle,
}

impl SignalRegistry {
    /// Install handlers for the reserved set and start forwarding deliveries.
    pub fn install() -> Result<(Self, mpsc::UnboundedReceiver<Signal>), LifecycleError> {
        let mut signals = Signals::new(RESERVED_SIGNALS.iter().map(|s| s.as_raw())).map_err(
            |source| LifecycleError::SignalInstall {
                signal: Signal::TERM,
                source,
            },
        )?;
        let handle = signals.handle();
        let (tx, rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("gem-signals".to_string())
            .spawn(move || {
                for raw in signals.forever() {
                    if tx.send(Signal(raw)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| LifecycleError::SignalInstall {
                signal: Signal::TERM,
                source,
            })?;

        Ok((
            Self {
                actions: Mutex::new(HashMap::new()),
                handle,
            },
            rx,
        ))
    }

    /// Bind `action` to `signal`, installing the OS handler on first use.
    ///
    /// Accepts a [`SignalAction`], its raw integer value or its name.
    /// On error nothing is changed.
    pub fn set_signal_action<A>(&self, signal: Signal, action: A) -> Result<(), LifecycleError>
    where
        A: TryInto<SignalAction>,
        A::Error: Into<LifecycleError>,
    {
        let action = action.try_into().map_err(Into::into)?;
        if signal.is_reserved() {
            return Err(LifecycleError::ReservedSignal(signal));
        }

        let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        if !actions.contains_key(&signal) {
            self.handle
                .add_signal(signal.as_raw())
                .map_err(|source| LifecycleError::SignalInstall { signal, source })?;
        }

        let previous = actions.insert(signal, action);
        tracing::debug!(
            signal = %signal,
            action = %action,
            previous = ?previous,
            "Signal action registered"
        );
        Ok(())
    }

    /// Current action for a signal, if registered.
    pub fn action(&self, signal: Signal) -> Option<SignalAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&signal)
            .copied()
    }

    /// Resolve a delivered signal into what the lifecycle loop must do.
    pub fn resolve(&self, signal: Signal) -> Dispatch {
        if signal.is_reserved() {
            return Dispatch::Stop;
        }
        match self.action(signal) {
            Some(SignalAction::Restart) => Dispatch::Restart,
            Some(SignalAction::Ignore) | None => Dispatch::Ignore,
        }
    }

    /// Snapshot of all registrations, ordered by signal number.
    pub fn registrations(&self) -> Vec<(Signal, SignalAction)> {
        let actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = actions.iter().map(|(s, a)| (*s, *a)).collect();
        out.sort_by_key(|(signal, _)| *signal);
        out
    }
}

impl Drop for SignalRegistry {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn last_write_wins() {
        let (registry, _rx) = SignalRegistry::install().unwrap();

        registry.set_signal_action(Signal::HUP, SignalAction::Restart).unwrap();
        registry.set_signal_action(Signal::USR1, SignalAction::Restart).unwrap();
        registry.set_signal_action(Signal::USR2, SignalAction::Ignore).unwrap();
        assert_eq!(registry.action(Signal::HUP), Some(SignalAction::Restart));
        assert_eq!(registry.action(Signal::USR1), Some(SignalAction::Restart));
        assert_eq!(registry.action(Signal::USR2), Some(SignalAction::Ignore));

        registry.set_signal_action(Signal::USR1, SignalAction::Ignore).unwrap();
        assert_eq!(registry.action(Signal::USR1), Some(SignalAction::Ignore));
        assert_eq!(registry.resolve(Signal::USR1), Dispatch::Ignore);
        assert_eq!(registry.resolve(Signal::HUP), Dispatch::Restart);
    }

    #[test]
    fn invalid_action_leaves_registry_unchanged() {
        let (registry, _rx) = SignalRegistry::install().unwrap();
        registry.set_signal_action(Signal::INT, SignalAction::Ignore).unwrap();

        let err = registry.set_signal_action(Signal::INT, -1).unwrap_err();
        assert_eq!(err.to_string(), "invalid signal action: -1");

        let err = registry.set_signal_action(Signal::INT, "reload").unwrap_err();
        assert_eq!(err.to_string(), "invalid signal action: reload");

        assert_eq!(registry.action(Signal::INT), Some(SignalAction::Ignore));
    }

    #[test]
    fn reserved_signal_cannot_be_remapped() {
        let (registry, _rx) = SignalRegistry::install().unwrap();

        for action in [SignalAction::Restart, SignalAction::Ignore] {
            let err = registry.set_signal_action(Signal::TERM, action).unwrap_err();
            assert!(matches!(err, LifecycleError::ReservedSignal(Signal::TERM)));
            assert_eq!(
                err.to_string(),
                "the signal SIGTERM is not allowed to be customized"
            );
        }

        assert_eq!(registry.action(Signal::TERM), None);
        assert_eq!(registry.resolve(Signal::TERM), Dispatch::Stop);
        assert!(registry.registrations().is_empty());
    }

    #[test]
    fn concurrent_registrations_are_serialized() {
        let (registry, _rx) = SignalRegistry::install().unwrap();
        let signals = [
            Signal::HUP,
            Signal::USR1,
            Signal::USR2,
            Signal::from_raw(libc::SIGWINCH),
            Signal::from_raw(libc::SIGURG),
            Signal::from_raw(libc::SIGALRM),
        ];

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let registry = &registry;
                scope.spawn(move || {
                    for round in 0..50 {
                        for signal in signals {
                            let action = if (worker + round) % 2 == 0 {
                                SignalAction::Restart
                            } else {
                                SignalAction::Ignore
                            };
                            registry.set_signal_action(signal, action).unwrap();
                        }
                    }
                });
            }
        });

        let registered = registry.registrations();
        assert_eq!(registered.len(), signals.len());
        let mut expected = signals.to_vec();
        expected.sort();
        assert_eq!(registered.iter().map(|(s, _)| *s).collect::<Vec<_>>(), expected);
        for signal in signals {
            assert!(registry.action(signal).is_some());
        }
    }

    #[test]
    fn registrations_are_ordered_by_signal_number() {
        let (registry, _rx) = SignalRegistry::install().unwrap();
        registry.set_signal_action(Signal::USR2, SignalAction::Ignore).unwrap();
        registry.set_signal_action(Signal::HUP, SignalAction::Restart).unwrap();

        assert_eq!(
            registry.registrations(),
            vec![
                (Signal::HUP, SignalAction::Restart),
                (Signal::USR2, SignalAction::Ignore),
            ]
        );
    }

    #[test]
    fn raw_and_named_actions() {
        assert_eq!(SignalAction::try_from(0).unwrap(), SignalAction::Restart);
        assert_eq!(SignalAction::try_from(1).unwrap(), SignalAction::Ignore);
        assert!(SignalAction::try_from(2).is_err());
        assert_eq!("Restart".parse::<SignalAction>().unwrap(), SignalAction::Restart);
    }

    #[test]
    fn signal_names() {
        assert_eq!("SIGHUP".parse::<Signal>().unwrap(), Signal::HUP);
        assert_eq!("usr2".parse::<Signal>().unwrap(), Signal::USR2);
        assert_eq!("15".parse::<Signal>().unwrap(), Signal::TERM);
        assert!("SIGBOGUS".parse::<Signal>().is_err());
        assert_eq!(Signal::TERM.to_string(), "SIGTERM");
        assert_eq!(Signal::from_raw(64).to_string(), "signal 64");
    }

    #[tokio::test]
    async fn delivered_signal_is_forwarded() {
        let (registry, mut rx) = SignalRegistry::install().unwrap();
        registry.set_signal_action(Signal::USR2, SignalAction::Ignore).unwrap();

        // SAFETY: raise only delivers SIGUSR2 to this process, which now has a handler.
        unsafe {
            libc::raise(libc::SIGUSR2);
        }

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Signal::USR2));
    }
}
