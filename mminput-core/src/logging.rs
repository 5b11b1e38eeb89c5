use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{atomic::Ordering, Mutex},
};

use once_cell::sync::Lazy;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

static HASHED_LOGS: Lazy<Mutex<Vec<u64>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Log `msg` at info level the first time it is seen in this process.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let hash = hasher.finish();

    // A poisoned lock only means another thread panicked mid-push; the list is still usable.
    let mut log = HASHED_LOGS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !log.contains(&hash) {
        info!("{msg}");
        log.push(hash);
    }
}

/// Install a `tracing` subscriber. `MMINPUT_DEBUG=1` lowers the default level to DEBUG;
/// `RUST_LOG` directives are honored on top of that. Calling this more than once is a no-op.
pub fn initialize_logging() {
    let is_debug = std::env::var("MMINPUT_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
