use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use crate::computable::Status;
use crate::error::{Error, Result};
use crate::node::{AnyNode, Node, Owned};
use crate::provider::{ProviderBase, ProviderKey};
use crate::scope::{ConsumerBody, Edge, EdgeKey, EdgeKind, Scope, ScopeInner};
use crate::unit::{Change, Unit};

/// The dependent a context acts for.
#[derive(Clone)]
pub(crate) enum Owner {
	Consumer {
		id: u64,
		body: Weak<ConsumerBody>,
	},
	Node {
		id: u64,
		key: ProviderKey,
		node: Weak<dyn AnyNode>,
	},
}

impl Owner {
	fn id(&self) -> u64 {
		match self {
			Owner::Consumer { id, .. } | Owner::Node { id, .. } => *id,
		}
	}

	fn is_disposed(&self) -> bool {
		match self {
			Owner::Consumer { body, .. } => body.upgrade().map_or(true, |body| body.is_disposed()),
			Owner::Node { node, .. } => node.upgrade().map_or(true, |node| node.is_disposed()),
		}
	}

	fn with_owned<R>(&self, func: impl FnOnce(&RefCell<Owned>) -> R) -> Option<R> {
		match self {
			Owner::Consumer { body, .. } => body.upgrade().map(|body| func(body.owned())),
			Owner::Node { node, .. } => node.upgrade().map(|node| func(node.owned())),
		}
	}

	pub(crate) fn local(&self, key: &ProviderKey) -> Option<Rc<dyn AnyNode>> {
		self.with_owned(|owned| owned.borrow().local(key)).flatten()
	}

	pub(crate) fn cache_local(&self, key: ProviderKey, node: Rc<dyn AnyNode>) {
		self.with_owned(move |owned| owned.borrow_mut().cache(key, node));
	}

	/// Subscription target for a watch edge: a node gets invalidated, a
	/// consumer gets its change callback.
	fn on_watched_change<T: 'static>(&self) -> impl Fn(&Change<T>) -> Result<()> + 'static {
		let owner = self.clone();
		move |change: &Change<T>| match &owner {
			Owner::Consumer { body, .. } => {
				if let Some(body) = body.upgrade() {
					body.notify();
				}
				Ok(())
			}
			Owner::Node { key, node, .. } => {
				let Some(node) = node.upgrade() else {
					return Ok(());
				};
				// A watcher still building gets this unit's first value from
				// the read that produced it, or from the future it awaits.
				if change.previous.is_none() && node.is_computing() {
					return Ok(());
				}
				node.invalidate(true).map_err(|source| Error::Invalidation {
					watcher: key.to_string(),
					source: Box::new(source),
				})
			}
		}
	}
}

/// Values a `listen_when` predicate may yield. A closed gate, or the same
/// gate twice in a row, skips the listener.
pub trait ListenGate: Clone + PartialEq + 'static {
	fn is_closed(&self) -> bool {
		false
	}
}

impl ListenGate for bool {
	fn is_closed(&self) -> bool {
		!*self
	}
}

impl<T> ListenGate for Option<T>
where
	T: Clone + PartialEq + 'static,
{
	fn is_closed(&self) -> bool {
		self.is_none()
	}
}

macro_rules! open_gate {
	($($ty:ty),*) => {
		$(impl ListenGate for $ty {})*
	};
}

open_gate!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, char, String, &'static str);

/// Handle a build function or consumer uses to reach other providers.
///
/// `read` returns the current value. `watch` does the same and also installs
/// an edge so that a change to the watched unit invalidates and rebuilds the
/// current unit, or notifies the consumer.
#[derive(Clone)]
pub struct Context {
	inner: Rc<ContextInner>,
}

struct ContextInner {
	scope: Weak<ScopeInner>,
	scope_id: Rc<str>,
	owner: Owner,
	path: Vec<ProviderKey>,
}

impl Context {
	pub(crate) fn for_node(
		scope: Weak<ScopeInner>,
		id: u64,
		key: ProviderKey,
		node: Weak<dyn AnyNode>,
		path: Vec<ProviderKey>,
	) -> Result<Context> {
		let Some(inner) = scope.upgrade() else {
			return Err(Error::ScopeDisposed {
				scope: String::new(),
			});
		};
		if !inner.is_mounted() {
			return Err(Error::ScopeDisposed {
				scope: inner.id().to_string(),
			});
		}

		Ok(Context {
			inner: Rc::new(ContextInner {
				scope_id: inner.id().clone(),
				scope,
				owner: Owner::Node { id, key, node },
				path,
			}),
		})
	}

	pub(crate) fn for_consumer(scope: Weak<ScopeInner>, id: u64, body: Weak<ConsumerBody>) -> Context {
		let scope_id = scope
			.upgrade()
			.map(|inner| inner.id().clone())
			.unwrap_or_else(|| "".into());
		Context {
			inner: Rc::new(ContextInner {
				scope,
				scope_id,
				owner: Owner::Consumer { id, body },
				path: Vec::new(),
			}),
		}
	}

	/// Providers being built on the way to this context, outermost first.
	pub(crate) fn path(&self) -> Vec<ProviderKey> {
		self.inner.path.clone()
	}

	pub(crate) fn owner(&self) -> Owner {
		self.inner.owner.clone()
	}

	fn disposed(&self) -> Error {
		Error::ScopeDisposed {
			scope: self.inner.scope_id.to_string(),
		}
	}

	pub fn scope(&self) -> Result<Scope> {
		Scope::upgrade(&self.inner.scope).ok_or_else(|| self.disposed())
	}

	/// Whether the dependent behind this context can still be notified.
	pub fn is_alive(&self) -> bool {
		!self.inner.owner.is_disposed()
			&& self
				.inner
				.scope
				.upgrade()
				.map_or(false, |scope| scope.is_mounted())
	}

	fn resolve<P: ProviderBase>(&self, provider: &P) -> Result<Rc<Node<P::Value>>> {
		let key = provider.meta().key();
		if self.inner.path.contains(key) {
			let mut path: Vec<String> = self.inner.path.iter().map(|key| key.to_string()).collect();
			path.push(key.to_string());
			tracing::warn!(path = %path.join(" -> "), "circular dependency");
			return Err(Error::CircularDependency { path });
		}

		let scope = self.scope()?;
		scope.resolve(provider, &self.inner.owner)
	}

	fn install<T>(&self, node: &Rc<Node<T>>, kind: EdgeKind, listener: impl Fn(&Change<T>) -> Result<()> + 'static)
	where
		T: Clone + 'static,
	{
		let owner = &self.inner.owner;
		let Some(scope) = self.inner.scope.upgrade() else {
			return;
		};
		if owner.is_disposed() || !scope.is_mounted() {
			return;
		}

		let target: Rc<dyn AnyNode> = node.clone();
		let watcher = match (kind, owner) {
			(EdgeKind::Watch, Owner::Node { node, .. }) => Some(node.clone()),
			_ => None,
		};
		let edge = Edge {
			_subscription: node.unit().subscribe(listener),
			target: Rc::downgrade(&target),
			watcher: watcher.clone(),
		};
		let key = EdgeKey {
			target: node.meta().key().clone(),
			kind,
		};

		let replaced = scope.install_edge(owner.id(), key, edge);
		drop(replaced);
		if let Some(watcher) = watcher {
			target.used_by(watcher);
		}
	}

	/// Current value without establishing an edge.
	pub fn read<P: ProviderBase>(&self, provider: &P) -> Result<P::Output> {
		let node = self.resolve(provider)?;
		P::output(&node, self)
	}

	/// Current value, re-delivered through invalidation whenever it changes.
	///
	/// The edge is installed once the value is produced, so building the
	/// watched unit does not count as a change.
	pub fn watch<P: ProviderBase>(&self, provider: &P) -> Result<P::Output> {
		let node = self.resolve(provider)?;
		let output = P::output(&node, self)?;
		self.install(&node, EdgeKind::Watch, self.inner.owner.on_watched_change());
		Ok(output)
	}

	/// The backing unit, without building it.
	pub fn unit<P: ProviderBase>(&self, provider: &P) -> Result<Unit<P::Value>> {
		Ok(self.resolve(provider)?.unit().clone())
	}

	pub fn status<P: ProviderBase>(&self, provider: &P) -> Result<Status> {
		Ok(self.resolve(provider)?.status())
	}

	/// Calls `listener` with the previous and next value on every later
	/// change of the provider's unit.
	pub fn listen<P, F>(&self, provider: &P, listener: F) -> Result<()>
	where
		P: ProviderBase,
		F: Fn(Option<&P::Value>, &P::Value) + 'static,
	{
		let node = self.resolve(provider)?;
		self.install(&node, EdgeKind::Listen, move |change: &Change<P::Value>| {
			listener(change.previous.as_ref(), &change.next);
			Ok(())
		});
		Ok(())
	}

	/// Like [`Context::listen`], gated by `when`: the listener only runs when
	/// the gate is open and differs from the one computed for the last change.
	pub fn listen_when<P, G, W, F>(&self, provider: &P, when: W, listener: F) -> Result<()>
	where
		P: ProviderBase,
		G: ListenGate,
		W: Fn(&Unit<P::Value>) -> G + 'static,
		F: Fn(Option<&P::Value>, &P::Value) + 'static,
	{
		let node = self.resolve(provider)?;
		let unit = Rc::downgrade(&node.unit().body);
		let last = RefCell::new(when(node.unit()));

		self.install(&node, EdgeKind::Listen, move |change: &Change<P::Value>| {
			let Some(body) = unit.upgrade() else {
				return Ok(());
			};
			let gate = when(&Unit { body });
			let repeated = *last.borrow() == gate;
			let closed = gate.is_closed();
			*last.borrow_mut() = gate;

			if !repeated && !closed {
				listener(change.previous.as_ref(), &change.next);
			}
			Ok(())
		});
		Ok(())
	}

	/// Clears the provider's cached result and rebuilds it if it was in use.
	pub fn invalidate<P: ProviderBase>(&self, provider: &P) -> Result<()> {
		let node: Rc<dyn AnyNode> = self.resolve(provider)?;
		node.invalidate(true)
	}

	/// Invalidates the unit this context builds, or notifies the consumer.
	pub fn invalidate_self(&self) -> Result<()> {
		match &self.inner.owner {
			Owner::Node { node, .. } => match node.upgrade() {
				Some(node) => node.invalidate(true),
				None => Ok(()),
			},
			Owner::Consumer { body, .. } => {
				if let Some(body) = body.upgrade() {
					body.notify();
				}
				Ok(())
			}
		}
	}

	/// Invalidates without an eager rebuild, then reads the fresh value.
	pub fn refresh<P: ProviderBase>(&self, provider: &P) -> Result<P::Output> {
		let node = self.resolve(provider)?;
		let erased: Rc<dyn AnyNode> = node.clone();
		erased.invalidate(false)?;
		P::output(&node, self)
	}

	/// Runs `func` when the owner is rebuilt, invalidated or disposed.
	pub fn on_dispose(&self, func: impl FnOnce() + 'static) {
		let mut func = Some(func);
		if !self.inner.owner.is_disposed() {
			self.inner.owner.with_owned(|owned| {
				if let Some(func) = func.take() {
					owned.borrow_mut().on_dispose(Box::new(func));
				}
			});
		}
		if let Some(func) = func {
			func();
		}
	}
}

impl Debug for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let owner = match &self.inner.owner {
			Owner::Consumer { id, .. } => format!("consumer {id}"),
			Owner::Node { key, .. } => format!("unit {key}"),
		};
		f.debug_struct("Context")
			.field("scope", &self.inner.scope_id)
			.field("owner", &owner)
			.field("path", &self.inner.path)
			.finish()
	}
}
