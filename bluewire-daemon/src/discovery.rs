/*!
 * Discovery Timer
 * Bounded discovery windows on the usable adapter
 */

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::daemon::Event;
use crate::model::{Adapter, Ubi};

/// Remote call the caller has to issue after a timer transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryCommand {
    Start(Ubi),
    Stop(Ubi),
}

/// BlueZ counts discovery per client, so only discovery started here is
/// ever stopped here.
#[derive(Debug, Default)]
pub struct DiscoveryTimer {
    generation: u64,
    timer: Option<JoinHandle<()>>,
    discovering_on: Option<Ubi>,
}

impl DiscoveryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.discovering_on.is_some()
    }

    pub fn adapter(&self) -> Option<&str> {
        self.discovering_on.as_deref()
    }

    /// Starts discovery on `adapter`. A zero timeout keeps discovery running
    /// until [`DiscoveryTimer::stop`]; otherwise expiry is delivered as
    /// [`Event::DiscoveryExpired`]. Starting again resets the window.
    pub fn start(
        &mut self,
        adapter: Option<&Adapter>,
        timeout_ms: u32,
        events: &mpsc::UnboundedSender<Event>,
    ) -> Vec<DiscoveryCommand> {
        let Some(adapter) = adapter else {
            return Vec::new();
        };
        self.disarm();

        let mut commands = Vec::new();
        if self.discovering_on.as_deref() != Some(adapter.ubi.as_str()) {
            if let Some(previous) = self.discovering_on.take() {
                commands.push(DiscoveryCommand::Stop(previous));
            }
            self.discovering_on = Some(adapter.ubi.clone());
            commands.push(DiscoveryCommand::Start(adapter.ubi.clone()));
        }

        if timeout_ms > 0 {
            let generation = self.generation;
            let events = events.clone();
            self.timer = Some(tokio::spawn(async move {
                sleep(Duration::from_millis(u64::from(timeout_ms))).await;
                let _ = events.send(Event::DiscoveryExpired { generation });
            }));
        }

        commands
    }

    /// Idempotent; a no-op without an adapter or without running discovery.
    pub fn stop(&mut self, adapter: Option<&Adapter>) -> Option<DiscoveryCommand> {
        if adapter.is_none() {
            return None;
        }
        self.disarm();
        self.discovering_on.take().map(DiscoveryCommand::Stop)
    }

    /// True if the expiry belongs to the current window.
    pub fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.timer.is_none() {
            return false;
        }
        self.timer = None;
        true
    }

    /// The adapter discovery was running on went away.
    pub fn forget(&mut self, ubi: &str) {
        if self.discovering_on.as_deref() == Some(ubi) {
            self.disarm();
            self.discovering_on = None;
        }
    }

    pub fn reset(&mut self) {
        self.disarm();
        self.discovering_on = None;
    }

    fn disarm(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
