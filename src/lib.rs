//! Client-side state synchronization engine for the Elevate goal tracker.
//!
//! The local store owns the canonical in-memory state and a durable JSON
//! mirror; every mutation is optimistic-local-first with a fire-and-forget
//! remote write behind it. Full pulls are server-authoritative, a websocket
//! change feed plus a polling watchdog keep devices converged in between,
//! and the session binder wires the lifecycle to auth events.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metadata;
pub mod realtime;
pub mod session;
pub mod store;
pub mod sync;
pub mod types;
pub mod wire;
pub mod writes;

pub use error::{SyncError, SyncResult};
pub use gateway::{HttpGateway, RemoteGateway, Table};
pub use realtime::{ChangeEvent, ChangeKind, ChannelStatus, Reconciler};
pub use session::{AuthEvent, SessionBinder, SessionEventKind, SessionHandle};
pub use store::Store;
pub use sync::{PullReport, PushReport, SharedStore, SyncEngine, SyncPolicy};
pub use types::{
    CalendarEvent, EventPatch, Goal, GoalPatch, Message, NewEvent, NewGoal, Objective, Role,
    StoreData,
};
pub use writes::{WriteKind, WriteOutcome};
