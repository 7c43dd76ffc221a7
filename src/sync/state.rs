//! Connectivity state machine
//!
//! `Offline → Online` on a platform signal, `Online → SyncInFlight` while a
//! drain runs, back to `Online` (or `Offline` if the platform dropped
//! mid-drain) when it ends. Only the orchestrator and the bridge move it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::events::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Offline,
    Online,
    SyncInFlight,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Offline => write!(f, "offline"),
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::SyncInFlight => write!(f, "sync_in_flight"),
        }
    }
}

struct Inner {
    state: ConnectivityState,
    /// Last platform signal; decides where `SyncInFlight` lands
    platform_online: bool,
    /// Came back online while a drain was in flight
    redrain: bool,
}

pub struct Connectivity {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl Connectivity {
    pub fn new(online: bool, events: EventBus) -> Self {
        let state = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        Self {
            inner: Mutex::new(Inner {
                state,
                platform_online: online,
                redrain: false,
            }),
            events,
        }
    }

    pub fn current(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    pub fn is_offline(&self) -> bool {
        self.current() == ConnectivityState::Offline
    }

    pub fn platform_online(&self) -> bool {
        self.inner.lock().platform_online
    }

    /// Apply a platform connectivity signal.
    ///
    /// Returns true when this signal brought the engine back online.
    pub(crate) fn set_platform(&self, online: bool) -> bool {
        let (changed, came_online) = {
            let mut inner = self.inner.lock();
            let was_online = inner.platform_online;
            inner.platform_online = online;
            if inner.state == ConnectivityState::SyncInFlight {
                // The running pass may have missed work queued while offline
                inner.redrain = online && (inner.redrain || !was_online);
                (None, false)
            } else {
                let next = if online {
                    ConnectivityState::Online
                } else {
                    ConnectivityState::Offline
                };
                let changed = (inner.state != next).then_some(next);
                inner.state = next;
                (changed, online && !was_online)
            }
        };

        if let Some(state) = changed {
            tracing::info!("Connectivity changed to {}", state);
            self.events
                .emit(EngineEvent::ConnectivityChanged { state });
        }
        came_online
    }

    /// Enter `SyncInFlight`. Fails when offline or already syncing.
    pub(crate) fn begin_sync(&self) -> bool {
        let entered = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectivityState::Online {
                inner.state = ConnectivityState::SyncInFlight;
                true
            } else {
                false
            }
        };
        if entered {
            self.events.emit(EngineEvent::ConnectivityChanged {
                state: ConnectivityState::SyncInFlight,
            });
        }
        entered
    }

    /// A drain driven elsewhere (the background context) started.
    pub(crate) fn enter_sync(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.state != ConnectivityState::SyncInFlight;
            inner.state = ConnectivityState::SyncInFlight;
            changed
        };
        if changed {
            self.events.emit(EngineEvent::ConnectivityChanged {
                state: ConnectivityState::SyncInFlight,
            });
        }
    }

    /// Leave `SyncInFlight`, landing wherever the platform signal says.
    ///
    /// Returns true when the platform came back online during the drain and
    /// another pass is owed.
    pub(crate) fn end_sync(&self) -> bool {
        let (next, redrain) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectivityState::SyncInFlight {
                return false;
            }
            inner.state = if inner.platform_online {
                ConnectivityState::Online
            } else {
                ConnectivityState::Offline
            };
            let redrain = std::mem::take(&mut inner.redrain) && inner.platform_online;
            (inner.state, redrain)
        };
        self.events
            .emit(EngineEvent::ConnectivityChanged { state: next });
        redrain
    }
}
