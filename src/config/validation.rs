//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listen addresses (non-empty, no separators the handshake uses)
//! - Validate value ranges (wait timeout, readiness grace, concurrency)
//! - Resolve the signal map into typed registrations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GemConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::GemConfig;
use crate::lifecycle::signals::{Signal, SignalAction};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &GemConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let server = &config.server;

    if server.addrs.is_empty() {
        errors.push(ValidationError::new("server.addrs", "at least one address is required"));
    }
    for (i, addr) in server.addrs.iter().enumerate() {
        if addr.trim().is_empty() {
            errors.push(ValidationError::new(format!("server.addrs[{}]", i), "address is empty"));
        } else if addr.contains(',') {
            errors.push(ValidationError::new(
                format!("server.addrs[{}]", i),
                format!("address {:?} must not contain ','", addr),
            ));
        }
    }

    if server.wait_timeout_secs == 0 {
        errors.push(ValidationError::new("server.wait_timeout_secs", "must be greater than 0"));
    }
    if server.concurrency == 0 {
        errors.push(ValidationError::new("server.concurrency", "must be greater than 0"));
    }
    if server.cert_file.is_some() != server.key_file.is_some() {
        errors.push(ValidationError::new(
            "server.cert_file",
            "cert_file and key_file must be set together",
        ));
    }

    if config.lifecycle.readiness_grace_ms == 0 {
        errors.push(ValidationError::new(
            "lifecycle.readiness_grace_ms",
            "must be greater than 0",
        ));
    }
    if let Err(mut signal_errors) = signal_actions(config) {
        errors.append(&mut signal_errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Typed signal registrations from `[lifecycle.signals]`.
pub fn signal_actions(config: &GemConfig) -> Result<Vec<(Signal, SignalAction)>, Vec<ValidationError>> {
    let mut resolved = Vec::new();
    let mut errors = Vec::new();

    for (name, action) in &config.lifecycle.signals {
        let field = format!("lifecycle.signals.{}", name);
        let signal = match name.parse::<Signal>() {
            Ok(signal) => signal,
            Err(e) => {
                errors.push(ValidationError::new(field, e));
                continue;
            }
        };
        if signal.is_reserved() {
            errors.push(ValidationError::new(
                field,
                format!("the signal {} is not allowed to be customized", signal),
            ));
            continue;
        }
        match action.parse::<SignalAction>() {
            Ok(action) => resolved.push((signal, action)),
            Err(e) => errors.push(ValidationError::new(field, e.to_string())),
        }
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GemConfig::default()).is_ok());
    }

    #[test]
    fn collects_all_errors() {
        let mut config = GemConfig::default();
        config.server.addrs = vec![":8080,:8081".to_string(), " ".to_string()];
        config.server.wait_timeout_secs = 0;
        config.server.cert_file = Some("cert.pem".to_string());
        config.lifecycle.signals.insert("SIGTERM".to_string(), "restart".to_string());
        config.lifecycle.signals.insert("SIGUSR1".to_string(), "reload".to_string());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.addrs[0]",
                "server.addrs[1]",
                "server.wait_timeout_secs",
                "server.cert_file",
                "lifecycle.signals.SIGTERM",
                "lifecycle.signals.SIGUSR1",
            ]
        );
        assert_eq!(
            errors[5].to_string(),
            "lifecycle.signals.SIGUSR1: invalid signal action: reload"
        );
    }

    #[test]
    fn signal_map_resolves() {
        let mut config = GemConfig::default();
        config.lifecycle.signals.insert("usr2".to_string(), "ignore".to_string());
        let actions = signal_actions(&config).unwrap();
        assert_eq!(
            actions,
            vec![
                (Signal::HUP, SignalAction::Restart),
                (Signal::USR2, SignalAction::Ignore),
            ]
        );
    }
}
