use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use fxhash::FxHashMap;

use crate::addr::WeakAddr;
use crate::batch;
use crate::computable::{Build, Computation, Pending, Reset, Status};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::provider::{Meta, ProviderKey};
use crate::scope::ScopeInner;
use crate::unit::Unit;

thread_local! {
	static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Ids shared by nodes and consumers; they key the watch-edge map.
pub(crate) fn next_id() -> u64 {
	NEXT_ID.with(|id| {
		let next = id.get();
		id.set(next + 1);
		next
	})
}

/// Type-erased view of a [`Node`], used by stores, edges and watcher lists.
pub trait AnyNode: 'static {
	fn id(&self) -> u64;
	fn key(&self) -> &ProviderKey;
	fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
	/// A build of this unit is running or awaited.
	fn is_computing(&self) -> bool;
	fn is_disposed(&self) -> bool;
	/// Clears a computed result. With `refresh`, a unit that was in use is
	/// rebuilt, right away or once the change being broadcast has reached
	/// every listener. A plain unit is reset to its initial value.
	fn invalidate(self: Rc<Self>, refresh: bool) -> Result<()>;
	/// Builds a computed unit left uncomputed by a deferred invalidation.
	fn rebuild(self: Rc<Self>) -> Result<()>;
	fn dispose(self: Rc<Self>);
	fn used_by(&self, watcher: Weak<dyn AnyNode>);
	fn not_used_by(&self, watcher: &Weak<dyn AnyNode>);
	fn owned(&self) -> &RefCell<Owned>;
}

/// Resources a dependent owns on behalf of its current build: transient
/// instances it read and teardown callbacks it registered.
#[derive(Default)]
pub struct Owned {
	locals: FxHashMap<ProviderKey, Rc<dyn AnyNode>>,
	disposers: Vec<Box<dyn FnOnce()>>,
}

impl Owned {
	pub fn local(&self, key: &ProviderKey) -> Option<Rc<dyn AnyNode>> {
		self.locals.get(key).cloned()
	}

	pub fn cache(&mut self, key: ProviderKey, node: Rc<dyn AnyNode>) {
		self.locals.insert(key, node);
	}

	pub fn on_dispose(&mut self, func: Box<dyn FnOnce()>) {
		self.disposers.push(func);
	}

	pub fn take_disposers(&mut self) -> Vec<Box<dyn FnOnce()>> {
		std::mem::take(&mut self.disposers)
	}

	pub fn take_locals(&mut self) -> Vec<Rc<dyn AnyNode>> {
		self.locals.drain().map(|(_, node)| node).collect()
	}
}

pub(crate) enum Kind<T> {
	Plain(Rc<dyn Fn() -> T>),
	Computed(Rc<Computation<T>>),
}

/// A unit together with the provider it was created from.
pub struct Node<T> {
	id: u64,
	meta: Meta,
	unit: Unit<T>,
	kind: Kind<T>,
	scope: Weak<ScopeInner>,
	owned: RefCell<Owned>,
	inner: RefCell<NodeInner>,
	this: Weak<Node<T>>,
}

struct NodeInner {
	used_by: BTreeSet<WeakAddr<dyn AnyNode>>,
	disposed: bool,
}

impl<T> Node<T>
where
	T: Clone + 'static,
{
	pub(crate) fn plain(meta: Meta, init: Rc<dyn Fn() -> T>, scope: Weak<ScopeInner>) -> Rc<Self> {
		let unit = Unit::new(meta.key().clone(), init());
		Self::with_kind(meta, unit, Kind::Plain(init), scope)
	}

	pub(crate) fn computed(meta: Meta, build: Build<T>, scope: Weak<ScopeInner>) -> Rc<Self> {
		let unit = Unit::empty(meta.key().clone());
		let computation = Computation::new(meta.key().clone(), build);
		Self::with_kind(meta, unit, Kind::Computed(computation), scope)
	}

	fn with_kind(meta: Meta, unit: Unit<T>, kind: Kind<T>, scope: Weak<ScopeInner>) -> Rc<Self> {
		let node = Rc::new_cyclic(|this| Node {
			id: next_id(),
			meta,
			unit,
			kind,
			scope,
			owned: RefCell::new(Owned::default()),
			inner: RefCell::new(NodeInner {
				used_by: BTreeSet::new(),
				disposed: false,
			}),
			this: this.clone(),
		});
		tracing::trace!(unit = %node.meta.key(), id = node.id, "unit created");
		node
	}

	pub fn unit(&self) -> &Unit<T> {
		&self.unit
	}

	pub fn meta(&self) -> &Meta {
		&self.meta
	}

	pub fn status(&self) -> Status {
		match &self.kind {
			Kind::Plain(_) => Status::Settled,
			Kind::Computed(computation) => computation.status(),
		}
	}

	fn closed(&self) -> Error {
		Error::ClosedUnit {
			unit: self.meta.key().to_string(),
		}
	}

	fn is_alive(&self) -> bool {
		!self.inner.borrow().disposed
			&& self
				.scope
				.upgrade()
				.map_or(false, |scope| scope.is_mounted())
	}

	/// Context for a build of this node, reached through `path`.
	fn build_context(&self, mut path: Vec<ProviderKey>) -> Result<Context> {
		self.teardown_build();
		path.push(self.meta.key().clone());
		let this: Weak<dyn AnyNode> = self.this.clone();
		Context::for_node(self.scope.clone(), self.id, self.meta.key().clone(), this, path)
	}

	/// Cancels the edges and runs the disposers of the previous build.
	fn teardown_build(&self) {
		if let Some(scope) = self.scope.upgrade() {
			scope.cancel_edges(self.id);
		}
		let disposers = self.owned.borrow_mut().take_disposers();
		for disposer in disposers {
			disposer();
		}
	}

	/// Current value, building it first for synchronous computed units.
	pub(crate) fn value(&self, via: &Context) -> Result<T> {
		if self.is_disposed() {
			return Err(self.closed());
		}
		match &self.kind {
			Kind::Plain(_) => self.unit.get().ok_or_else(|| self.closed()),
			Kind::Computed(computation) => computation.trigger(&self.unit, || self.build_context(via.path())),
		}
	}

	pub(crate) fn pending(&self, via: &Context) -> Result<Pending<T>> {
		if self.is_disposed() {
			return Err(self.closed());
		}
		match &self.kind {
			Kind::Plain(_) => Ok(Pending::ready(self.value(via))),
			Kind::Computed(computation) if computation.is_async() => {
				computation.trigger_async(&self.unit, || self.build_context(via.path()))
			}
			Kind::Computed(_) => Ok(Pending::ready(self.value(via))),
		}
	}

	fn refresh(&self, computation: &Rc<Computation<T>>) -> Result<()> {
		if computation.is_async() {
			let pending = computation.trigger_async(&self.unit, || self.build_context(Vec::new()))?;
			if let Some(scope) = self.scope.upgrade() {
				scope.spawn(pending);
			}
			Ok(())
		} else {
			computation
				.trigger(&self.unit, || self.build_context(Vec::new()))
				.map(drop)
		}
	}
}

impl<T> AnyNode for Node<T>
where
	T: Clone + 'static,
{
	fn id(&self) -> u64 {
		self.id
	}

	fn key(&self) -> &ProviderKey {
		self.meta.key()
	}

	fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
		self
	}

	fn is_computing(&self) -> bool {
		self.status() == Status::Computing
	}

	fn is_disposed(&self) -> bool {
		self.inner.borrow().disposed
	}

	fn invalidate(self: Rc<Self>, refresh: bool) -> Result<()> {
		if self.is_disposed() {
			return Ok(());
		}

		match &self.kind {
			Kind::Plain(init) => {
				tracing::debug!(unit = %self.meta.key(), "state reset");
				self.unit.set(init())
			}
			Kind::Computed(computation) => {
				let reset = computation.reset();
				tracing::debug!(unit = %self.meta.key(), refresh, "invalidated");

				let Reset::Idle { was_active } = reset else {
					// The running build drops its result once it returns.
					return Ok(());
				};

				self.teardown_build();
				if !(refresh && was_active && self.is_alive()) {
					return Ok(());
				}
				if batch::in_batch() {
					let this: Rc<dyn AnyNode> = self.clone();
					batch::defer(Rc::downgrade(&this));
					Ok(())
				} else {
					self.refresh(computation)
				}
			}
		}
	}

	fn rebuild(self: Rc<Self>) -> Result<()> {
		match &self.kind {
			Kind::Computed(computation) if computation.status() == Status::Uncomputed && self.is_alive() => {
				self.refresh(computation)
			}
			_ => Ok(()),
		}
	}

	fn dispose(self: Rc<Self>) {
		{
			let mut inner = self.inner.borrow_mut();
			if inner.disposed {
				return;
			}
			inner.disposed = true;
		}
		tracing::debug!(unit = %self.meta.key(), id = self.id, "disposing unit");

		if let Kind::Computed(computation) = &self.kind {
			drop(computation.reset());
		}
		self.teardown_build();
		self.unit.dispose();

		let watchers = std::mem::take(&mut self.inner.borrow_mut().used_by);
		for watcher in watchers {
			if let Some(watcher) = watcher.upgrade() {
				if let Err(err) = watcher.invalidate(false) {
					tracing::warn!(unit = %self.meta.key(), error = %err, "failed to invalidate watcher");
				}
			}
		}

		let locals = self.owned.borrow_mut().take_locals();
		for local in locals {
			local.dispose();
		}
	}

	fn used_by(&self, watcher: Weak<dyn AnyNode>) {
		self.inner.borrow_mut().used_by.insert(WeakAddr::new(watcher));
	}

	fn not_used_by(&self, watcher: &Weak<dyn AnyNode>) {
		if let Ok(mut inner) = self.inner.try_borrow_mut() {
			inner.used_by.remove(&WeakAddr::new(watcher.clone()));
		}
	}

	fn owned(&self) -> &RefCell<Owned> {
		&self.owned
	}
}

impl<T> Node<T> {
	pub(crate) fn watcher_count(&self) -> usize {
		self.inner.borrow().used_by.len()
	}
}

impl<T> Drop for Node<T> {
	fn drop(&mut self) {
		if let Some(scope) = self.scope.upgrade() {
			scope.cancel_edges(self.id);
		}
	}
}
