use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};

use crate::config::LoggingConfig;
use crate::error::XferoError;

const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_LOG_FILES: usize = 7;

/// Starts the logger described by `logging`. The returned handle must be kept
/// alive for the life of the process.
///
/// An unparsable spec falls back to `info`; it never stops the process.
pub fn init(logging: &LoggingConfig) -> Result<LoggerHandle, XferoError> {
    let logger = Logger::try_with_str(&logging.loggers).or_else(|e| {
        eprintln!(
            "Invalid logging.loggers '{}' ({}); falling back to '{}'",
            logging.loggers,
            e,
            LoggingConfig::DEFAULT_SPEC
        );
        Logger::try_with_str(LoggingConfig::DEFAULT_SPEC)
    });
    let logger = logger.map_err(|e| XferoError::Error(format!("logger: {}", e)))?;

    let logger = match &logging.log_directory {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("xfero"))
            .rotate(
                Criterion::Size(ROTATE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(KEEP_LOG_FILES),
            )
            .duplicate_to_stderr(Duplicate::Warn),
        None => logger.log_to_stderr(),
    };

    logger
        .format(detailed_format)
        .start()
        .map_err(|e| XferoError::Error(format!("logger: {}", e)))
}
