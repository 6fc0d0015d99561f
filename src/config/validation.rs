//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, pool prefix, tool paths)
//! - Check that the address pool can hold every concurrent client
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::ServerConfig;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }
    if config.listener.max_frame_bytes == 0 {
        errors.push(ValidationError::new("listener.max_frame_bytes", "must be at least 1"));
    }
    if config.listener.max_frame_bytes > u32::MAX as usize {
        errors.push(ValidationError::new(
            "listener.max_frame_bytes",
            "cannot exceed what a 4-byte length prefix can express",
        ));
    }
    if config.listener.read_buffer_bytes == 0 {
        errors.push(ValidationError::new("listener.read_buffer_bytes", "must be at least 1"));
    }

    if config.renderer.executable.as_os_str().is_empty() {
        errors.push(ValidationError::new("renderer.executable", "must not be empty"));
    }
    if config.renderer.timeout_secs == Some(0) {
        errors.push(ValidationError::new("renderer.timeout_secs", "must be positive when set"));
    }

    if !config.namespace.ip_command.is_absolute() {
        errors.push(ValidationError::new("namespace.ip_command", "must be an absolute path"));
    }
    if !config.namespace.iptables_command.is_absolute() {
        errors.push(ValidationError::new("namespace.iptables_command", "must be an absolute path"));
    }
    let prefix = config.namespace.address_pool_prefix;
    if !(8..=28).contains(&prefix) {
        errors.push(ValidationError::new(
            "namespace.address_pool_prefix",
            format!("{} is outside 8..=28", prefix),
        ));
    } else if (config.listener.max_connections as u64) > config.namespace.link_count() {
        errors.push(ValidationError::new(
            "listener.max_connections",
            format!(
                "{} exceeds the {} links available in the address pool",
                config.listener.max_connections,
                config.namespace.link_count()
            ),
        ));
    }
    if config.namespace.name_prefix.is_empty()
        || !config.namespace.name_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        errors.push(ValidationError::new(
            "namespace.name_prefix",
            "must be non-empty ASCII letters, digits or '-'",
        ));
    }

    if config.recorder.drain_timeout_ms == 0 {
        errors.push(ValidationError::new("recorder.drain_timeout_ms", "must be positive"));
    }
    if config.recorder.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("recorder.connect_timeout_ms", "must be positive"));
    }
    if config.recorder.relay_buffer_bytes == 0 {
        errors.push(ValidationError::new("recorder.relay_buffer_bytes", "must be at least 1"));
    }
    if config.recorder.queue_chunks == 0 {
        errors.push(ValidationError::new("recorder.queue_chunks", "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_all_errors() {
        let mut config = ServerConfig::default();
        config.listener.max_connections = 0;
        config.namespace.ip_command = PathBuf::from("ip");
        config.recorder.drain_timeout_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["listener.max_connections", "namespace.ip_command", "recorder.drain_timeout_ms"]
        );
    }

    #[test]
    fn session_queue_must_hold_a_chunk() {
        let mut config = ServerConfig::default();
        config.recorder.queue_chunks = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "recorder.queue_chunks");
    }

    #[test]
    fn pool_must_fit_connections() {
        let mut config = ServerConfig::default();
        config.namespace.address_pool_prefix = 28;
        config.listener.max_connections = 5;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("4 links"));
    }

    #[test]
    fn prefix_range() {
        let mut config = ServerConfig::default();
        config.namespace.address_pool_prefix = 30;
        assert!(validate_config(&config).is_err());
    }
}
