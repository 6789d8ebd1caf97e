//! Two-stage shutdown: the first CTRL+C drains in-flight runs through the
//! engine's grace period, the second exits immediately.

use tokio::sync::mpsc;

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Stop polling and let the engine drain in-flight runs.
    Drain,
    /// Skip the grace period and exit now.
    Exit,
}

fn phase_for_press(presses: u32) -> ShutdownPhase {
    if presses <= 1 {
        ShutdownPhase::Drain
    } else {
        ShutdownPhase::Exit
    }
}

/// Stream of shutdown phases derived from CTRL+C presses.
pub struct ShutdownSignal {
    rx: mpsc::UnboundedReceiver<ShutdownPhase>,
}

impl ShutdownSignal {
    /// Next phase. Pends forever when signal handling is unavailable, so a
    /// worker without a controlling terminal keeps running.
    pub async fn next(&mut self) -> ShutdownPhase {
        match self.rx.recv().await {
            Some(phase) => phase,
            None => std::future::pending().await,
        }
    }
}

/// Watch CTRL+C and translate presses into shutdown phases.
pub fn watch_ctrl_c() -> ShutdownSignal {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut presses = 0_u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            presses += 1;
            let phase = phase_for_press(presses);
            if tx.send(phase).is_err() || phase == ShutdownPhase::Exit {
                return;
            }
        }
    });
    ShutdownSignal { rx }
}
