//! # deskvm-a11y
//!
//! Queries and drives a remote GUI through its accessibility bus.
//!
//! The tree is never materialized: an [`Accessible`] is a handle to one
//! remote object, and every query other than the name, description and help
//! text (snapshotted at construction) is a fresh call on the bus. Searches
//! therefore always reflect what is on screen right now.
//!
//! ## Layers
//!
//! - [`A11yBus`]: typed boundary to the bus. Failures arrive as structured
//!   [`BusErrorKind`](deskvm_error::BusErrorKind)s.
//! - [`DBusA11yBus`]: the `zbus` implementation of that boundary.
//! - [`Accessible`] / [`Action`]: the node model, with capability views
//!   gated on the interfaces the object reported at construction.
//! - [`Query`]: predicate-based depth-first search.
//! - [`app`]: locating application roots on the bus.
//! - `testing` (feature `testing`): an in-memory bus for exercising callers
//!   without a VM.

pub mod app;
mod bus;
mod dbus;
mod node;
mod query;
mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use app::{application_root, application_roots, bus_names, ROOT_PATH};
pub use bus::{interface, A11yBus, BusConnector, ObjectRef, RELATION_LABELLED_BY};
pub use dbus::{DBusA11yBus, DBusConnector};
pub use node::{
    Accessible, Action, ActionIface, Capabilities, ComponentIface, EditableTextIface, TextIface,
    SET_TEXT_INTERVAL, SET_TEXT_TIMEOUT,
};
pub use query::{Query, Retry};
pub use state::{State, StateSet};

pub use deskvm_error::{Error, Result};
