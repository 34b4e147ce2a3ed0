use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, never, select, tick};

use super::controller::Controller;
use crate::engine::Envelope;
use crate::stream::lock;

/// Background loop owning every asynchronous controller mutation.
///
/// Waits on the bus, the polling timer (only while the controller wants
/// timers) and the quit channel. Exits when the quit channel fires or closes.
pub(crate) fn run(
    controller: Arc<Mutex<Controller>>,
    bus_rx: Receiver<Envelope>,
    quit_rx: Receiver<()>,
    update_interval: Duration,
) {
    let mut ticker = never();
    let mut ticking = false;

    loop {
        let timers_enabled = select! {
            recv(quit_rx) -> _ => break,
            recv(bus_rx) -> envelope => {
                let Ok(envelope) = envelope else { break };
                let mut c = lock(&controller);
                c.handle_envelope(envelope);
                c.timers_enabled()
            }
            recv(ticker) -> _ => {
                let mut c = lock(&controller);
                // Ticks queued before the timers were switched off are stale.
                if c.timers_enabled() {
                    c.on_tick();
                }
                c.timers_enabled()
            }
        };

        if timers_enabled != ticking {
            ticking = timers_enabled;
            ticker = if ticking {
                tick(update_interval)
            } else {
                never()
            };
            tracing::trace!(ticking, "update timer toggled");
        }
    }

    tracing::debug!("pipeline event loop exited");
}
