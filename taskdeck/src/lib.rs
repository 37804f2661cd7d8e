//! # taskdeck
//!
//! Client-side core of a personal task dashboard backed by a hosted store.
//!
//! A [`Session`] mirrors the signed-in principal's tasks in memory, keeps the
//! mirror converged with the store through a realtime subscription, and notifies
//! observers (statistics panels, task lists) after every change. Task creation
//! and edits are confirmed by the store before they show up locally; completion
//! toggles and deletions are applied optimistically.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskdeck::{Principal, SeaOrmStoreBuilder, SessionBuilder, StaticAuth};
//!
//! let store = Arc::new(SeaOrmStoreBuilder::from_env().build().await?);
//! let auth = Arc::new(StaticAuth::signed_in(Principal::new(user_id)));
//!
//! let session = SessionBuilder::new(store, auth).start().await?;
//! session.add_task("Buy milk", None).await?;
//!
//! let stats = session.statistics();
//! println!("{}% done", stats.snapshot().completion_rate);
//!
//! session.sign_out().await?;
//! ```
//!
//! ## Key types
//!
//! - [`TaskMirror`]: the local task collection and its mutation rules
//! - [`ChangeNotifier`]: payload-free change signal for observers
//! - [`StatisticsView`]: completion statistics kept current by the notifier
//! - [`ProfileEditor`]: two-phase editing of the principal's profile
//! - [`RemoteStore`]: the hosted backend seam, implemented by [`SeaOrmStore`]

pub mod auth;
pub mod conflict;
pub mod messages;
pub mod mirror;
pub mod notifier;
pub mod profile;
mod realtime;
pub mod session;
pub mod stats;
pub mod store;

pub use auth::{AuthError, AuthProvider, Principal, StaticAuth};
pub use messages::{
    ChangeNotification, NewTask, OwnerId, PayloadError, Profile, ProfilePatch, RealtimeEvent,
    Table, Task, TaskId, TaskPatch, WriteKind,
};
pub use mirror::{MirrorError, OptimisticPolicy, TaskMirror};
pub use notifier::{ChangeNotifier, ObserverHandle};
pub use profile::{EditMode, ProfileEditor, ProfileError};
pub use session::{Session, SessionBuilder, SessionConfig, SessionError};
pub use stats::{StatisticsView, TaskStats};
pub use store::{RemoteStore, SeaOrmStore, SeaOrmStoreBuilder, StoreError, Subscription};

// Re-export sea-orm for callers that want to reach the underlying connection
pub use sea_orm;
