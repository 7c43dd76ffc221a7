//! Background synchronization bridge
//!
//! The background context can drain while no foreground client is attached.
//! Both sides talk only through JSON envelopes:
//!
//! ```text
//! background                         foreground
//!    | -- request_pending_items -->      |
//!    | <-- pending_items ----------      |
//!    | -- sync_started ------------>     |  connectivity: SyncInFlight
//!    | -- item_synced {id} -------->     |  Synced event, view updated
//!    | -- item_rejected {id} ------>     |  Rejected event, view updated
//!    | -- sync_completed {results} ->    |  DrainCompleted, back to Online
//! ```

pub mod background;
pub mod foreground;
pub mod protocol;

pub use background::{BackgroundContext, BackgroundHandle};
pub use foreground::{ForegroundBridge, LocalStatus};
pub use protocol::{BridgeMessage, Envelope};
