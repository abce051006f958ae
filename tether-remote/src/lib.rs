//! Remote collaborators for tether.
//!
//! The sync layer talks to the backend through three narrow seams:
//! - [`RemoteStore`]: row CRUD by id and blob storage
//! - [`AuthApi`]: phone OTP and password sign-in, sign-out, auth pushes
//! - [`RealtimeTransport`]: per-channel row event listeners
//!
//! Two implementations are provided. [`MemoryRemote`] is an in-process
//! backend with a call log and failure injection, used by tests and offline
//! builds. [`RestClient`] speaks the PostgREST / GoTrue / storage HTTP APIs
//! over `reqwest`.

mod auth;
mod error;
pub mod memory;
mod realtime;
pub mod rest;
mod store;

pub use auth::{AuthApi, AuthEvent};
pub use error::{RemoteError, RemoteResult};
pub use memory::MemoryRemote;
pub use realtime::{
    ChannelId, EventSink, Filter, ListenerId, ListenerSpec, RealtimeTransport, RowEvent,
    RowEventKind,
};
pub use rest::{RestAuth, RestClient, RestConfig, RestStore};
pub use store::RemoteStore;
