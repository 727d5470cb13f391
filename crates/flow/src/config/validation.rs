use crate::error::FlowError;

use super::types::FlowConfig;

impl FlowConfig {
    /// Validate the config: positive limits, well-formed keys, non-zero timeout.
    pub fn validate(&self) -> Result<(), FlowError> {
        self.validate_join()?;
        self.validate_deputy_limits()?;
        Ok(())
    }

    fn validate_join(&self) -> Result<(), FlowError> {
        if self.join.timeout_ms == Some(0) {
            return Err(FlowError::Config(
                "join.timeout_ms must be positive; omit it to wait indefinitely".into(),
            ));
        }
        Ok(())
    }

    /// Ensure every concurrency limit is at least 1 and keyed `service.task`.
    fn validate_deputy_limits(&self) -> Result<(), FlowError> {
        if self.deputy.default_limit == 0 {
            return Err(FlowError::Config("deputy.default_limit must be at least 1".into()));
        }
        for (key, limit) in &self.deputy.limits {
            match key.split_once('.') {
                Some((service, task)) if !service.is_empty() && !task.is_empty() => {}
                _ => {
                    return Err(FlowError::Config(format!(
                        "deputy limit key '{key}' must look like 'service.task'"
                    )));
                }
            }
            if *limit == 0 {
                return Err(FlowError::Config(format!(
                    "deputy limit for '{key}' must be at least 1"
                )));
            }
        }
        Ok(())
    }
}
