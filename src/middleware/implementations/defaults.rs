// Register the built-in handlers selected by configuration
use crate::config::MiddlewareConfig;
use crate::database::Database;
use crate::middleware::error::SetupError;
use crate::middleware::traits::OperationKind;

use super::{QueryLogger, ReadOnlyGuard, SlowQueryWarning, READ_ONLY_KINDS};

/// Register the built-in handlers enabled in `config`.
///
/// Order: logger outermost so it sees every outcome, then the slow query
/// timer, then the read-only guard closest to the driver.
pub fn install_defaults(db: &mut Database, config: &MiddlewareConfig) -> Result<(), SetupError> {
    if config.query_logging {
        db.register(QueryLogger, &OperationKind::ALL)?;
    }
    if config.slow_query_warning {
        db.register(
            SlowQueryWarning::from_millis(config.slow_query_threshold_ms),
            &[OperationKind::Exec, OperationKind::Query, OperationKind::Commit],
        )?;
    }
    if config.read_only {
        db.register(ReadOnlyGuard::new(), &READ_ONLY_KINDS)?;
    }

    tracing::debug!("Installed default handlers: {:?}", db.registry());
    Ok(())
}
