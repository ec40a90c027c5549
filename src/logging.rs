use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "gradebookd";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_LOG_FILES: usize = 3;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();

struct LoggingState {
    log_dir: PathBuf,
    _logger: LoggerHandle,
}

/// Initializes rotating file logs under `<workspace>/logs`.
///
/// stdout carries the IPC stream, so diagnostics must never be written there.
/// Calling this again with the same workspace is a no-op; a different
/// workspace is rejected because the logger is process-global.
pub fn init(workspace: &Path) -> Result<(), String> {
    let log_dir = workspace.join("logs");

    if let Some(state) = LOGGING_STATE.get() {
        if state.log_dir == log_dir {
            return Ok(());
        }
        return Err(format!(
            "logging already initialized at {}",
            state.log_dir.display()
        ));
    }

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| format!("create log dir {}: {}", log_dir.display(), e))?;

    let logger = Logger::try_with_env_or_str("info")
        .map_err(|e| format!("logger spec: {}", e))?
        .log_to_file(
            FileSpec::default()
                .directory(&log_dir)
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(MAX_LOG_FILES),
        )
        .start()
        .map_err(|e| format!("logger start: {}", e))?;

    let state = LoggingState {
        log_dir,
        _logger: logger,
    };
    // A concurrent init can only lose the race to an identical value.
    let _ = LOGGING_STATE.set(state);
    Ok(())
}
