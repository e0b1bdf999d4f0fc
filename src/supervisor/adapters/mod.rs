//! Supervisor transport adapters.
//!
//! Adapters translate external I/O into gate and supervisor calls.

pub mod stdio;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gate::AccessGate;
use crate::supervisor::Supervisor;

/// Start supervisor-owned transport adapters.
pub fn start(
    gate: AccessGate,
    supervisor: Supervisor,
    shutdown: CancellationToken,
    stdio_enabled: bool,
) {
    if stdio_enabled {
        stdio::start(gate, supervisor, shutdown);
    } else {
        info!("supervisor stdio adapter: disabled by config");
    }
}
