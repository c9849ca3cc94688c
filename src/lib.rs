// #![warn(missing_docs)]

//! Client-side session layer for the EPICS Channel Access protocol.
//!
//! The wire exchange itself (searches, virtual circuits, message framing) belongs
//! to a [`Transport`]. What this crate adds on top is the state a client needs to
//! use one safely:
//!
//! - A per-context channel [cache] tracking connection state, failed attempts and
//!   connection listeners, with handle-identity checks on every connection event.
//! - A cooperative polling driver. Every blocking operation is a bounded loop
//!   around [`Session::poll_with`], so callbacks keep being delivered while the
//!   caller waits, and no wait is ever unbounded.
//! - `get`, and `put` in fire-and-forget, blocking and callback flavours, with
//!   completion correlated per channel name.
//! - Subscriptions delivering decoded values and metadata, and synchronous groups
//!   batching gets and puts to a single completion point.
//! - Translation between DBR payloads and values in [dbr].
//!
//! [`transport::loopback`] provides an in-process transport backed by a table
//! of simulated process variables, used by the tests and handy for exercising
//! client code without a network.
//!
//! ## Example
//!
//! ```
//! use caclient::{
//!     PutMode, PutStatus, Session,
//!     dbr::CaValue,
//!     transport::loopback::{LoopbackTransport, PvDatabase},
//! };
//! # use std::time::Duration;
//!
//! let database = PvDatabase::new();
//! let value = database.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//!
//! let session = Session::new(LoopbackTransport::new(database)).unwrap();
//! let channel = session.create_channel("NUMERIC_VALUE", true, None).unwrap();
//! assert_eq!(session.get(&channel).unwrap(), CaValue::Long(42));
//!
//! let status = session
//!     .put(&channel, 7i32, PutMode::Wait(Duration::from_secs(1)))
//!     .unwrap();
//! assert_eq!(status, PutStatus::Completed);
//! assert_eq!(value.load(), 7);
//! ```
//!
//! [`Transport`]: transport::Transport

pub mod cache;
pub mod dbr;
pub mod session;
pub mod transport;

mod utils;

pub use crate::cache::{CacheDump, ConnectionCallback};
pub use crate::session::{
    CaError, Channel, GetOptions, MonitorCallback, MonitorEvent, PendingValue, PutCallback,
    PutMode, PutStatus, Session, SessionBuilder, SessionConfig, Subscription, SyncGroup,
};
