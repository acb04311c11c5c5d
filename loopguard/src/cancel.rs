//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, warn};

/// Shared flag checked by the controller between phases and while the agent
/// runs. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Flip `token` on the first Ctrl-C. The listener runs on its own thread with
/// a current-thread tokio runtime.
pub fn install_ctrl_c_handler(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("loopguard-ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(err = %err, "cannot start signal runtime; Ctrl-C will not cancel");
                    return;
                }
            };
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    debug!("Ctrl-C received");
                    token.cancel();
                }
                Err(err) => warn!(err = %err, "failed to listen for Ctrl-C"),
            }
        });
    if let Err(err) = spawned {
        warn!(err = %err, "cannot spawn Ctrl-C listener");
    }
}
