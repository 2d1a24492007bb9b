//! # docsync
//!
//! Offline-first document synchronization. Applications read and write a
//! local cache of JSON-like documents; the client keeps that cache in sync
//! with a remote authority over two resumable streams, one for listening
//! to query results and one for sending writes.
//!
//! - Writes apply locally at once and stay queued until the authority
//!   acknowledges or rejects them.
//! - Query subscriptions deliver snapshots that merge cached data, pending
//!   writes and remote updates, flagged with `from_cache` and
//!   `has_pending_writes`.
//! - Listen targets resume from the last token after a reconnect, and
//!   existence filters detect documents deleted while offline.
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use docsync::api::SetOptions;
//! use docsync::core::{ListenOptions, Query, SyncClient};
//! use docsync::model::{DatabaseId, DocumentKey};
//! use docsync::remote::{InMemoryTransport, MultiplexedConnection, NoopTokenProvider};
//! use docsync::settings::SyncSettings;
//! use docsync::value::Value;
//!
//! # async fn demo() -> docsync::error::SyncResult<()> {
//! let (transport, _authority) = InMemoryTransport::pair();
//! let client = SyncClient::connect(
//!     SyncSettings::new(DatabaseId::for_project("demo")),
//!     Arc::new(MultiplexedConnection::client(transport)),
//!     Arc::new(NoopTokenProvider),
//! )?;
//!
//! let mut rooms = client
//!     .subscribe(Query::collection("rooms")?, ListenOptions::default())
//!     .await?;
//!
//! let key = DocumentKey::from_string("rooms/lobby")?;
//! let data = BTreeMap::from([("title".to_string(), Value::from_string("Lobby"))]);
//! client.set_document(&key, data, SetOptions::default()).await?;
//!
//! while let Some(snapshot) = rooms.next().await {
//!     let snapshot = snapshot?;
//!     println!("{} rooms, from cache: {}", snapshot.len(), snapshot.from_cache());
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

pub use crate::core::{Subscription, SyncClient};
pub use crate::error::{SyncError, SyncErrorCode, SyncResult};
pub use crate::settings::SyncSettings;
