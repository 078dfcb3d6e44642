//! OS pairing for peripherals that protect their characteristics.
//!
//! A bonding cycle registers a pairing-state observer, asks the OS to pair,
//! and ends when the observed device reaches `Bonded` or `None`. At most
//! one cycle is in flight; the operation that needed bonding is not retried.

use crate::domain::models::{BondState, DeviceHandle};
use crate::infrastructure::bluetooth::backend::{BleBackend, BondStateStream};
use crate::infrastructure::bluetooth::session::{SessionEvent, Subscription};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct BondCycle {
    id: u64,
    device: DeviceHandle,
    observer: Subscription,
    pairing: Subscription,
}

impl BondCycle {
    fn deregister(self) {
        self.observer.dispose();
        self.pairing.dispose();
    }
}

pub struct BondHandler {
    backend: Arc<dyn BleBackend>,
    next_cycle: u64,
    in_flight: Option<BondCycle>,
}

impl BondHandler {
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self {
            backend,
            next_cycle: 0,
            in_flight: None,
        }
    }

    pub fn is_bonding(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start pairing with `device`. Returns `false` when a cycle is already
    /// in flight and the request was ignored.
    pub fn start(
        &mut self,
        device: &DeviceHandle,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        if let Some(cycle) = &self.in_flight {
            info!(
                "Bonding with {} already in progress; ignoring request for {}",
                cycle.device, device
            );
            return false;
        }

        self.next_cycle += 1;
        let id = self.next_cycle;

        // Register before pairing starts so no broadcast is missed.
        let broadcasts = self.backend.bond_state_changes();
        let observer = Subscription::spawn(
            "bond-observer",
            observe_bond_states(id, device.clone(), broadcasts, events.clone()),
        );

        let backend = self.backend.clone();
        let target = device.clone();
        let pairing_events = events.clone();
        let pairing = Subscription::spawn("create-bond", async move {
            info!("Requesting bond with {}", target);
            if let Err(error) = backend.create_bond(&target).await {
                error!("Failed to start bonding with {}: {}", target, error);
                let _ = pairing_events.send(SessionEvent::BondInitiationFailed { cycle: id, error });
            }
        });

        self.in_flight = Some(BondCycle {
            id,
            device: device.clone(),
            observer,
            pairing,
        });
        true
    }

    /// End cycle `id`. Returns `true` only for the call that actually
    /// deregistered the observer.
    pub fn finish(&mut self, id: u64) -> bool {
        match self.in_flight.take() {
            Some(cycle) if cycle.id == id => {
                debug!("Deregistering bond observer for {}", cycle.device);
                cycle.deregister();
                true
            }
            other => {
                self.in_flight = other;
                false
            }
        }
    }

    pub fn is_current(&self, id: u64) -> bool {
        self.in_flight.as_ref().map(|c| c.id == id).unwrap_or(false)
    }

    /// Abandon any cycle in flight, e.g. on session teardown.
    pub fn cancel(&mut self) {
        if let Some(cycle) = self.in_flight.take() {
            warn!("Abandoning bonding with {}", cycle.device);
            cycle.deregister();
        }
    }
}

async fn observe_bond_states(
    cycle: u64,
    device: DeviceHandle,
    mut broadcasts: BondStateStream,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(change) = broadcasts.next().await {
        if change.device != device {
            debug!("Ignoring bond state {:?} of {}", change.state, change.device);
            continue;
        }

        if change.state.is_terminal() {
            info!("Bond state of {}: {:?}", device, change.state);
            let _ = events.send(SessionEvent::BondFinished {
                cycle,
                state: change.state,
            });
            return;
        }

        info!("Bonding with {}...", device);
        let _ = events.send(SessionEvent::BondProgress {
            cycle,
            state: change.state,
        });
    }

    warn!("Bond state broadcasts ended before {} settled", device);
    let _ = events.send(SessionEvent::BondFinished {
        cycle,
        state: BondState::None,
    });
}
