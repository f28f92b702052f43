//! The server instance an application runs.
//!
//! # Responsibilities
//! - Hold the addresses, engine tuning, wait timeout and signal map
//! - Run one process generation: startup, serving, signal dispatch,
//!   restart coordination, drain, close callbacks
//!
//! # Lifecycle
//! ```text
//! run()
//!   ├─ install signal forwarding, register actions
//!   ├─ detect handshake → open listeners → serve → notify parent
//!   ├─ loop
//!   │    ├─ SIGTERM / Control::stop → stop
//!   │    ├─ Restart / Control::restart → spawn coordinator task
//!   │    │    (loop keeps running)
//!   │    ├─ Ignore  → nothing
//!   │    └─ child ready → stop
//!   └─ cancel pending restart → drain → close callbacks → Stopped
//! ```

use std::collections::BTreeMap;
use std::error::Error;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::validation::signal_actions;
use crate::config::{ConfigError, GemConfig, LifecycleConfig, ServerConfig};
use crate::http::status::{status_router, StatusState};
use crate::http::HttpServer;
use crate::lifecycle::drain::DrainController;
use crate::lifecycle::handshake::Handshake;
use crate::lifecycle::restart::{RestartCommand, RestartCoordinator};
use crate::lifecycle::signals::{Dispatch, Signal, SignalAction, SignalRegistry};
use crate::lifecycle::startup::{notify_parent_ready, prepare};
use crate::lifecycle::control::{Control, ControlRequest};
use crate::lifecycle::LifecycleError;
use crate::observability::metrics;

/// Application hook run once the server has drained.
pub type CloseCallback = Box<dyn FnOnce() -> Result<(), Box<dyn Error + Send + Sync>> + Send>;

/// Why the lifecycle loop ended.
#[derive(Debug)]
enum StopReason {
    Terminated(Signal),
    Requested(String),
    HandedOver(Child),
}

pub struct Server {
    addrs: Vec<String>,
    engine: HttpServer,
    wait_timeout: Duration,
    readiness_grace: Duration,
    command: RestartCommand,
    signal_actions: BTreeMap<Signal, SignalAction>,
    close_callbacks: Vec<CloseCallback>,
    metrics: Option<PrometheusHandle>,
    control: Control,
    requests: mpsc::UnboundedReceiver<ControlRequest>,
}

impl Server {
    /// A server for `app` on `addrs`. `SIGHUP` restarts by default.
    pub fn new<S: AsRef<str>>(addrs: &[S], app: Router) -> Self {
        let config = ServerConfig::default();
        let mut signal_actions = BTreeMap::new();
        signal_actions.insert(Signal::HUP, SignalAction::Restart);
        let (control, requests) = Control::channel();

        Self {
            addrs: addrs.iter().map(|a| a.as_ref().to_string()).collect(),
            engine: HttpServer::new(app),
            wait_timeout: config.wait_timeout(),
            readiness_grace: LifecycleConfig::default().readiness_grace(),
            command: RestartCommand::current(),
            signal_actions,
            close_callbacks: Vec::new(),
            metrics: None,
            control,
            requests,
        }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// Apply engine tuning and the wait timeout. Addresses are left as given.
    pub fn load_config(&mut self, config: &ServerConfig) {
        self.engine.load_config(config);
        self.wait_timeout = config.wait_timeout();
    }

    /// Apply a whole validated file: engine tuning, restart settings and signal map.
    pub fn configure(&mut self, config: &GemConfig) -> Result<(), ConfigError> {
        self.load_config(&config.server);
        self.readiness_grace = config.lifecycle.readiness_grace();

        if config.lifecycle.executable.is_some() || config.lifecycle.args.is_some() {
            let current = RestartCommand::current();
            let program = config
                .lifecycle
                .executable
                .clone()
                .map(PathBuf::from)
                .unwrap_or(current.program);
            let args = match &config.lifecycle.args {
                Some(args) => args.iter().map(OsString::from).collect(),
                None => current.args,
            };
            self.command = RestartCommand { program, args };
        }

        for (signal, action) in signal_actions(config).map_err(ConfigError::Validation)? {
            self.signal_actions.insert(signal, action);
        }
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        self.engine.config()
    }

    /// Bind `action` to `signal`. Last write wins; on error nothing changes.
    pub fn set_signal_action<A>(&mut self, signal: Signal, action: A) -> Result<(), LifecycleError>
    where
        A: TryInto<SignalAction>,
        A::Error: Into<LifecycleError>,
    {
        let action = action.try_into().map_err(Into::into)?;
        if signal.is_reserved() {
            return Err(LifecycleError::ReservedSignal(signal));
        }
        self.signal_actions.insert(signal, action);
        Ok(())
    }

    pub fn signal_action(&self, signal: Signal) -> Option<SignalAction> {
        self.signal_actions.get(&signal).copied()
    }

    pub fn add_close_callback<F>(&mut self, callback: F)
    where
        F: FnOnce() -> Result<(), Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        self.close_callbacks.push(Box::new(callback));
    }

    pub fn set_restart_command(&mut self, command: RestartCommand) {
        self.command = command;
    }

    pub fn set_readiness_grace(&mut self, grace: Duration) {
        self.readiness_grace = grace;
    }

    pub fn set_tls(&mut self, tls: Option<RustlsConfig>) {
        self.engine.set_tls(tls);
    }

    /// Render this recorder on the built-in metrics route.
    pub fn set_metrics_handle(&mut self, handle: Option<PrometheusHandle>) {
        self.metrics = handle;
    }

    /// Handle that stops or restarts `run` the way the signals do.
    pub fn control_handle(&self) -> Control {
        self.control.clone()
    }

    /// Run until stopped or handed over, reading the handshake from the environment.
    pub async fn run(self) -> Result<(), LifecycleError> {
        self.run_with(Handshake::from_process_env()).await
    }

    /// Run one process generation with an explicit handshake.
    pub async fn run_with(mut self, handshake: Handshake) -> Result<(), LifecycleError> {
        let (registry, mut signals) = SignalRegistry::install()?;
        for (signal, action) in &self.signal_actions {
            registry.set_signal_action(*signal, *action)?;
        }

        let name = self.engine.config().name.clone();
        let prepared = prepare(&name, &self.addrs, &handshake)?;
        let generation = Arc::new(prepared.generation);
        let listeners = Arc::new(prepared.listeners);
        let coordinator = RestartCoordinator::new(self.command.clone(), self.readiness_grace);

        let tracker = self.engine.tracker().clone();
        self.engine.merge(status_router(StatusState {
            generation: generation.clone(),
            tracker,
            coordinator: coordinator.clone(),
            metrics: self.metrics.clone(),
        }));
        let engine = Arc::new(self.engine);

        let copies = listeners
            .serving_copies()
            .map_err(|source| LifecycleError::Bind {
                addr: generation.addrs.join(","),
                source,
            })?;
        let tasks = copies
            .into_iter()
            .map(|(addr, listener)| engine.serve(addr, listener))
            .collect();

        if generation.graceful_restart {
            notify_parent_ready(&prepared.table);
        }
        tracing::info!(
            generation = %generation.id,
            pid = generation.pid,
            signals = ?registry.registrations(),
            "Server running"
        );

        let (handoff_tx, mut handoff_rx) = mpsc::unbounded_channel::<Child>();
        let mut requests = self.requests;
        let mut restarts: Vec<JoinHandle<()>> = Vec::new();
        let spawn_restart = |restarts: &mut Vec<JoinHandle<()>>| {
            restarts.retain(|task| !task.is_finished());
            let coordinator = coordinator.clone();
            let listeners = listeners.clone();
            let handoff = handoff_tx.clone();
            restarts.push(tokio::spawn(async move {
                if let Ok(Some(child)) = coordinator.restart(&listeners).await {
                    let _ = handoff.send(child);
                }
            }));
        };

        let reason = loop {
            tokio::select! {
                Some(signal) = signals.recv() => match registry.resolve(signal) {
                    Dispatch::Stop => {
                        metrics::record_signal(&signal.to_string(), "stop");
                        break StopReason::Terminated(signal);
                    }
                    Dispatch::Restart => {
                        metrics::record_signal(&signal.to_string(), "restart");
                        tracing::info!(signal = %signal, "Restart signal received");
                        spawn_restart(&mut restarts);
                    }
                    Dispatch::Ignore => {
                        metrics::record_signal(&signal.to_string(), "ignore");
                        tracing::debug!(signal = %signal, "Signal ignored");
                    }
                },
                Some(child) = handoff_rx.recv() => break StopReason::HandedOver(child),
                Some(request) = requests.recv() => match request {
                    ControlRequest::Stop { reason } => break StopReason::Requested(reason),
                    ControlRequest::Restart => {
                        tracing::info!("Restart requested");
                        spawn_restart(&mut restarts);
                    }
                },
            }
        };

        // A cycle still in flight sees the drain and kills its child.
        coordinator.begin_drain();
        for task in restarts {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Restart task failed");
            }
        }
        if let Ok(child) = handoff_rx.try_recv() {
            tracing::info!(child_pid = child.id(), "Child took over before the stop landed");
        }
        match &reason {
            StopReason::Terminated(signal) => tracing::info!(signal = %signal, "Stopping without handoff"),
            StopReason::Requested(why) => tracing::info!(reason = %why, "Stop requested"),
            StopReason::HandedOver(child) => tracing::info!(child_pid = child.id(), "Handed over to child"),
        }

        let report = DrainController::new(engine, tasks, listeners)
            .stop(self.wait_timeout)
            .await;
        tracing::info!(outcome = ?report.outcome, elapsed = ?report.elapsed, "Server drained");

        for callback in self.close_callbacks {
            if let Err(e) = callback() {
                tracing::error!(error = %e, "Close callback failed");
            }
        }

        coordinator.mark_stopped();
        drop(registry);
        tracing::info!(generation = %generation.id, "Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new(&[":8080", ":4343"], Router::new())
    }

    #[test]
    fn wait_timeout_is_configurable() {
        let mut server = server();
        assert_eq!(server.wait_timeout(), Duration::from_secs(30));

        server.set_wait_timeout(Duration::from_secs(10));
        assert_eq!(server.wait_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn load_config_applies_wait_timeout_and_keeps_addrs() {
        let mut server = server();
        let config = ServerConfig {
            name: "fasthttp".to_string(),
            addrs: vec![":9090".to_string()],
            wait_timeout_secs: 5,
            ..ServerConfig::default()
        };
        server.load_config(&config);

        assert_eq!(server.wait_timeout(), Duration::from_secs(5));
        assert_eq!(server.config().name, "fasthttp");
        assert_eq!(server.addrs(), &[":8080", ":4343"]);
    }

    #[test]
    fn signal_actions_validate_before_storing() {
        let mut server = server();
        assert_eq!(server.signal_action(Signal::HUP), Some(SignalAction::Restart));

        server.set_signal_action(Signal::HUP, SignalAction::Ignore).unwrap();
        server.set_signal_action(Signal::USR2, "restart").unwrap();
        assert_eq!(server.signal_action(Signal::HUP), Some(SignalAction::Ignore));
        assert_eq!(server.signal_action(Signal::USR2), Some(SignalAction::Restart));

        let err = server.set_signal_action(Signal::HUP, -1).unwrap_err();
        assert_eq!(err.to_string(), "invalid signal action: -1");
        assert_eq!(server.signal_action(Signal::HUP), Some(SignalAction::Ignore));

        let err = server.set_signal_action(Signal::TERM, SignalAction::Restart).unwrap_err();
        assert_eq!(err.to_string(), "the signal SIGTERM is not allowed to be customized");
        assert_eq!(server.signal_action(Signal::TERM), None);
    }

    #[test]
    fn configure_reads_lifecycle_section() {
        let mut server = server();
        let mut config = GemConfig::default();
        config.lifecycle.readiness_grace_ms = 250;
        config.lifecycle.executable = Some("/usr/local/bin/gem".to_string());
        config.lifecycle.args = Some(vec!["--config".to_string(), "gem.toml".to_string()]);
        config
            .lifecycle
            .signals
            .insert("SIGUSR1".to_string(), "ignore".to_string());

        server.configure(&config).unwrap();
        assert_eq!(server.readiness_grace, Duration::from_millis(250));
        assert_eq!(
            server.command,
            RestartCommand::new("/usr/local/bin/gem", ["--config", "gem.toml"])
        );
        assert_eq!(server.signal_action(Signal::USR1), Some(SignalAction::Ignore));
    }
}
