//! Signal dispositions for the daemon process.
//!
//! A [`SignalMap`] maps a closed set of [`Signal`]s to a [`SignalAction`]. The
//! map is resolved once, inside the daemon, by [`install`]: ignored and
//! default signals get their kernel disposition directly, callbacks and
//! `SIGTERM` are routed through a signal-hook iterator on a dispatcher thread
//! so user code never runs in signal-handler context.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::LOG_TARGET;
use crate::error::{DaemonError, DaemonResult};

/// Signals a daemon may remap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Usr1,
    Usr2,
    Pipe,
    Alrm,
    Term,
    Chld,
    Tstp,
    Ttin,
    Ttou,
    Winch,
}

impl Signal {
    /// Every recognised signal.
    pub const ALL: [Signal; 13] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Usr1,
        Signal::Usr2,
        Signal::Pipe,
        Signal::Alrm,
        Signal::Term,
        Signal::Chld,
        Signal::Tstp,
        Signal::Ttin,
        Signal::Ttou,
        Signal::Winch,
    ];

    /// The platform signal number.
    pub fn number(self) -> libc::c_int {
        match self {
            Signal::Hup => SIGHUP,
            Signal::Int => SIGINT,
            Signal::Quit => SIGQUIT,
            Signal::Usr1 => SIGUSR1,
            Signal::Usr2 => SIGUSR2,
            Signal::Pipe => SIGPIPE,
            Signal::Alrm => SIGALRM,
            Signal::Term => SIGTERM,
            Signal::Chld => SIGCHLD,
            Signal::Tstp => SIGTSTP,
            Signal::Ttin => SIGTTIN,
            Signal::Ttou => SIGTTOU,
            Signal::Winch => SIGWINCH,
        }
    }

    /// The conventional `SIGxxx` name.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
            Signal::Pipe => "SIGPIPE",
            Signal::Alrm => "SIGALRM",
            Signal::Term => "SIGTERM",
            Signal::Chld => "SIGCHLD",
            Signal::Tstp => "SIGTSTP",
            Signal::Ttin => "SIGTTIN",
            Signal::Ttou => "SIGTTOU",
            Signal::Winch => "SIGWINCH",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A signal name outside the recognised set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised signal name '{0}'")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM` as well as the bare `TERM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("SIG").unwrap_or(s);
        Signal::ALL
            .into_iter()
            .find(|signal| &signal.name()[3..] == bare)
            .ok_or_else(|| UnknownSignal(s.to_owned()))
    }
}

/// What the daemon does when a signal arrives.
#[derive(Clone)]
pub enum SignalAction {
    /// Discard the signal.
    Ignore,
    /// Restore the kernel default (usually termination).
    Default,
    /// Run a callback on the dispatcher thread.
    Callback(Arc<dyn Fn() + Send + Sync>),
}

impl SignalAction {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        SignalAction::Callback(Arc::new(f))
    }
}

impl fmt::Debug for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Ignore => f.write_str("Ignore"),
            SignalAction::Default => f.write_str("Default"),
            SignalAction::Callback(_) => f.write_str("Callback(Fn)"),
        }
    }
}

/// User-supplied signal dispositions.
#[derive(Debug, Clone, Default)]
pub struct SignalMap {
    actions: BTreeMap<Signal, SignalAction>,
}

impl SignalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the action for `signal`, returning the one it replaces.
    pub fn set(&mut self, signal: Signal, action: SignalAction) -> Option<SignalAction> {
        self.actions.insert(signal, action)
    }

    pub fn get(&self, signal: Signal) -> Option<&SignalAction> {
        self.actions.get(&signal)
    }

    /// Dispositions actually applied: terminal job-control signals are
    /// ignored unless the user maps them.
    pub fn resolved(&self) -> BTreeMap<Signal, SignalAction> {
        let mut out: BTreeMap<Signal, SignalAction> = [Signal::Tstp, Signal::Ttin, Signal::Ttou]
            .into_iter()
            .map(|signal| (signal, SignalAction::Ignore))
            .collect();
        out.extend(self.actions.iter().map(|(k, v)| (*k, v.clone())));
        out
    }
}

/// Applies `map` to this process and starts the dispatcher thread.
///
/// `SIGTERM` is always caught: a mapped callback runs first, then
/// `terminate` is set and `on_terminate` notifies the runtime.
pub(crate) fn install<F>(
    map: &SignalMap,
    terminate: Arc<AtomicBool>,
    on_terminate: F,
) -> DaemonResult<()>
where
    F: Fn() + Send + 'static,
{
    let mut callbacks: HashMap<libc::c_int, Arc<dyn Fn() + Send + Sync>> = HashMap::new();
    let mut term_callback = None;

    for (signal, action) in map.resolved() {
        if signal == Signal::Term {
            match action {
                SignalAction::Callback(callback) => term_callback = Some(callback),
                other => debug!(
                    target: LOG_TARGET,
                    action = ?other,
                    "SIGTERM is always handled by the runtime; mapping ignored"
                ),
            }
            continue;
        }
        match action {
            SignalAction::Ignore => crate::sys::unix::ignore_signal(signal.number()),
            SignalAction::Default => crate::sys::unix::default_signal(signal.number()),
            SignalAction::Callback(callback) => {
                callbacks.insert(signal.number(), callback);
                Ok(())
            }
        }
        .map_err(|source| DaemonError::SignalInstall { source })?;
    }

    let mut caught: Vec<libc::c_int> = callbacks.keys().copied().collect();
    caught.push(SIGTERM);
    let mut signals = Signals::new(&caught).map_err(|source| DaemonError::SignalInstall { source })?;

    thread::Builder::new()
        .name("signal-dispatch".to_owned())
        .spawn(move || {
            for number in signals.forever() {
                if number == SIGTERM {
                    info!(target: LOG_TARGET, "termination signal received");
                    if let Some(callback) = &term_callback {
                        run_callback(number, callback.as_ref());
                    }
                    terminate.store(true, Ordering::SeqCst);
                    on_terminate();
                } else if let Some(callback) = callbacks.get(&number) {
                    run_callback(number, callback.as_ref());
                }
            }
        })
        .map_err(|source| DaemonError::SignalInstall { source })?;
    Ok(())
}

fn run_callback(number: libc::c_int, callback: &(dyn Fn() + Send + Sync)) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(target: LOG_TARGET, signal = number, "signal callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::prefixed("SIGTERM", Signal::Term)]
    #[case::bare("USR1", Signal::Usr1)]
    #[case::job_control("SIGTTOU", Signal::Ttou)]
    fn parses_signal_names(#[case] name: &str, #[case] expected: Signal) {
        assert_eq!(name.parse::<Signal>(), Ok(expected));
    }

    #[rstest]
    #[case::uncatchable("SIGKILL")]
    #[case::lowercase("sigterm")]
    #[case::empty("")]
    fn rejects_unknown_names(#[case] name: &str) {
        assert_eq!(name.parse::<Signal>(), Err(UnknownSignal(name.to_owned())));
    }

    #[test]
    fn names_round_trip_through_display() {
        for signal in Signal::ALL {
            assert_eq!(signal.to_string().parse::<Signal>(), Ok(signal));
        }
    }

    #[test]
    fn job_control_signals_are_ignored_by_default() {
        let resolved = SignalMap::new().resolved();
        let ignored: Vec<Signal> = resolved
            .iter()
            .filter(|(_, action)| matches!(action, SignalAction::Ignore))
            .map(|(signal, _)| *signal)
            .collect();
        assert_eq!(ignored, vec![Signal::Tstp, Signal::Ttin, Signal::Ttou]);
    }

    #[test]
    fn user_map_overrides_defaults() {
        let mut map = SignalMap::new();
        map.set(Signal::Tstp, SignalAction::Default);
        map.set(Signal::Usr1, SignalAction::callback(|| {}));
        let resolved = map.resolved();
        assert!(matches!(resolved.get(&Signal::Tstp), Some(SignalAction::Default)));
        assert!(matches!(resolved.get(&Signal::Usr1), Some(SignalAction::Callback(_))));
        assert!(matches!(resolved.get(&Signal::Ttin), Some(SignalAction::Ignore)));
    }
}
