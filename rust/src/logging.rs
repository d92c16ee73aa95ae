use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "converse.log";
const LOG_FILTER_ENV: &str = "CONVERSE_LOG";

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once per process. Later calls are no-ops, so
/// every constructor can call this.
pub fn init_logging(data_dir: &str) {
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = std::fs::create_dir_all(data_dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Path::new(data_dir).join(LOG_FILE));
        let file_layer = match file {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("[converse] could not open {LOG_FILE}: {e}");
                None
            }
        };

        // Another subscriber (tests, host app) may already be installed.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
