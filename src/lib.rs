//! Scoped reactive providers.
//!
//! A provider describes how to create a unit of state. Units live in a
//! [`Scope`], are built lazily on first read and memoized, and are rebuilt
//! when a provider they watch changes.

pub mod macros;

mod addr;
mod batch;
mod computable;
mod context;
mod error;
mod family;
mod host;
mod node;
mod provider;
mod registry;
mod scope;
mod unit;

pub use computable::{Pending, Status};
pub use context::{Context, ListenGate};
pub use error::{Error, Result};
pub use family::Family;
pub use host::Host;
pub use node::{AnyNode, Node};
pub use provider::{Declarable, FutureProvider, Meta, Provider, ProviderBase, ProviderKey, StateProvider};
pub use registry::{Binding, Instance, InstanceStore, Registry};
pub use scope::{Consumer, Declaration, Phase, Scope, ScopeBuilder, Spawner};
pub use unit::{Change, Subscription, Unit};
