use super::models::Config;
use crate::task::TaskType;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Tool capacity key '{name}' is not a known task type")]
    UnknownTool { name: String },

    #[error("Tool capacity for '{name}' must be positive")]
    ZeroCapacity { name: String },

    #[error("protocols.max_buffer_bytes must be positive")]
    ZeroBuffer,

    #[error("Throttle needs both max_messages and period_ms, got {max_messages} per {period_ms}ms")]
    InconsistentThrottle { max_messages: u64, period_ms: u64 },

    #[error("queue.{field} must be positive")]
    NonPositive { field: &'static str },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_tools(config)?;
    validate_protocols(config)?;
    validate_queue(config)?;
    Ok(())
}

/// Every override names a task type and grants at least one slot
fn validate_tools(config: &Config) -> Result<(), ValidationError> {
    for (name, capacity) in &config.tools.capacity {
        if name.parse::<TaskType>().is_err() {
            return Err(ValidationError::UnknownTool { name: name.clone() });
        }
        if *capacity == 0 {
            return Err(ValidationError::ZeroCapacity { name: name.clone() });
        }
    }
    Ok(())
}

fn validate_protocols(config: &Config) -> Result<(), ValidationError> {
    if config.protocols.max_buffer_bytes.as_u64() == 0 {
        return Err(ValidationError::ZeroBuffer);
    }
    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    let throttle = config.queue.throttle;
    // Both zero means unthrottled; exactly one zero is a mistake
    if (throttle.max_messages == 0) != (throttle.period_ms == 0) {
        return Err(ValidationError::InconsistentThrottle {
            max_messages: throttle.max_messages,
            period_ms: throttle.period_ms,
        });
    }
    if config.queue.poll_interval_ms == 0 {
        return Err(ValidationError::NonPositive {
            field: "poll_interval_ms",
        });
    }
    if config.queue.status_capacity == 0 {
        return Err(ValidationError::NonPositive {
            field: "status_capacity",
        });
    }
    if config.queue.delivery_concurrency == 0 {
        return Err(ValidationError::NonPositive {
            field: "delivery_concurrency",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;
    use crate::task::Throttle;
    use std::time::Duration;

    #[test]
    fn test_valid_config() {
        let mut config = Config::default();
        config.tools.capacity.insert("s3_upload".into(), 2);
        config.queue.throttle = Throttle::new(10, Duration::from_secs(1));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_unknown_tool() {
        let mut config = Config::default();
        config.tools.capacity.insert("teleport".into(), 1);
        assert_eq!(
            validate(&config),
            Err(ValidationError::UnknownTool {
                name: "teleport".into()
            })
        );
    }

    #[test]
    fn test_zero_capacity() {
        let mut config = Config::default();
        config.tools.capacity.insert("hash".into(), 0);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroCapacity { .. })
        ));
    }

    #[test]
    fn test_zero_buffer() {
        let mut config = Config::default();
        config.protocols.max_buffer_bytes = ByteSize(0);
        assert_eq!(validate(&config), Err(ValidationError::ZeroBuffer));
    }

    #[test]
    fn test_half_configured_throttle() {
        let mut config = Config::default();
        config.queue.throttle.max_messages = 5;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InconsistentThrottle { .. })
        ));
    }

    #[test]
    fn test_zero_delivery_concurrency() {
        let mut config = Config::default();
        config.queue.delivery_concurrency = 0;
        assert_eq!(
            validate(&config),
            Err(ValidationError::NonPositive {
                field: "delivery_concurrency"
            })
        );
    }

    #[test]
    fn test_zero_poll_interval() {
        let mut config = Config::default();
        config.queue.poll_interval_ms = 0;
        assert_eq!(
            validate(&config),
            Err(ValidationError::NonPositive {
                field: "poll_interval_ms"
            })
        );
    }
}
