use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use futures::future::{FutureExt, LocalBoxFuture};
use fxhash::{FxHashMap, FxHashSet};

use crate::computable::Pending;
use crate::context::{Context, Owner};
use crate::error::{Error, Result};
use crate::node::{next_id, AnyNode, Node, Owned};
use crate::provider::{Declarable, FamilyArgs, Meta, ProviderBase, ProviderKey};
use crate::registry::{Binding, Instance, InstanceStore, Registry};
use crate::unit::{Subscription, Unit};

/// Hands asynchronous refreshes to the host's local executor.
pub type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

/// What a scope knows about a declared provider.
pub enum Declaration {
	Single {
		keep_alive: bool,
		binding: Binding,
	},
	Family {
		type_id: TypeId,
		type_name: &'static str,
		instantiate: Rc<dyn Fn(&FamilyArgs) -> Result<Binding>>,
	},
}

impl Declaration {
	fn type_id(&self) -> TypeId {
		match self {
			Declaration::Single { binding, .. } => binding.type_id(),
			Declaration::Family { type_id, .. } => *type_id,
		}
	}

	fn type_name(&self) -> &'static str {
		match self {
			Declaration::Single { binding, .. } => binding.type_name(),
			Declaration::Family { type_name, .. } => type_name,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Mounted,
	Disposing,
	Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EdgeKind {
	Watch,
	Listen,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EdgeKey {
	pub target: ProviderKey,
	pub kind: EdgeKind,
}

/// A live subscription from a dependent to a unit. Dropping the edge
/// unsubscribes.
pub(crate) struct Edge {
	pub _subscription: Subscription,
	pub target: Weak<dyn AnyNode>,
	/// Set for computed watchers, which are tracked on the target.
	pub watcher: Option<Weak<dyn AnyNode>>,
}

impl Drop for Edge {
	fn drop(&mut self) {
		if let (Some(target), Some(watcher)) = (self.target.upgrade(), &self.watcher) {
			target.not_used_by(watcher);
		}
	}
}

/// A lifecycle container: owns the kept-alive and family units declared in
/// it, the watch edges of its dependents and its teardown callbacks.
#[derive(Clone)]
pub struct Scope {
	inner: Rc<ScopeInner>,
}

pub struct ScopeInner {
	id: Rc<str>,
	parent: Option<Scope>,
	store: Rc<dyn InstanceStore>,
	spawner: Option<Spawner>,
	root: RefCell<Option<Consumer>>,
	state: RefCell<ScopeState>,
}

struct ScopeState {
	phase: Phase,
	declared: FxHashMap<ProviderKey, Declaration>,
	families: FxHashSet<ProviderKey>,
	edges: FxHashMap<u64, FxHashMap<EdgeKey, Edge>>,
	teardown: Vec<Box<dyn FnOnce()>>,
	children: Vec<Weak<ScopeInner>>,
	consumers: Vec<Weak<ConsumerBody>>,
}

thread_local! {
	static NEXT_SCOPE: Cell<u64> = const { Cell::new(1) };
}

/// Configures and mounts a [`Scope`].
pub struct ScopeBuilder {
	id: Option<Rc<str>>,
	parent: Option<Scope>,
	store: Option<Rc<dyn InstanceStore>>,
	spawner: Option<Spawner>,
	declarations: Vec<Box<dyn Declarable>>,
}

impl ScopeBuilder {
	pub fn id(mut self, id: impl Into<Rc<str>>) -> Self {
		self.id = Some(id.into());
		self
	}

	/// Declares a provider or family. A later declaration with the same key
	/// replaces an earlier one, which is how overrides are installed.
	pub fn provide(mut self, provider: impl Declarable + 'static) -> Self {
		self.declarations.push(Box::new(provider));
		self
	}

	pub fn provide_all(mut self, providers: impl IntoIterator<Item = Box<dyn Declarable>>) -> Self {
		self.declarations.extend(providers);
		self
	}

	pub fn store(mut self, store: Rc<dyn InstanceStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn spawner(mut self, spawner: impl Fn(LocalBoxFuture<'static, ()>) + 'static) -> Self {
		self.spawner = Some(Rc::new(spawner));
		self
	}

	pub fn mount(self) -> Result<Scope> {
		let id = self.id.unwrap_or_else(|| {
			let next = NEXT_SCOPE.with(|id| {
				let next = id.get();
				id.set(next + 1);
				next
			});
			format!("scope#{next}").into()
		});
		let store = self
			.store
			.or_else(|| self.parent.as_ref().map(|parent| parent.inner.store.clone()))
			.unwrap_or_else(|| Registry::shared() as Rc<dyn InstanceStore>);
		let spawner = self
			.spawner
			.or_else(|| self.parent.as_ref().and_then(|parent| parent.inner.spawner.clone()));

		if let Some(parent) = &self.parent {
			parent.ensure_mounted()?;
		}
		if !store.claim_scope(&id) {
			return Err(Error::ScopeMounted { scope: id.to_string() });
		}

		let mut conflict = None;
		let inner = Rc::new_cyclic(|this: &Weak<ScopeInner>| {
			let mut declared: FxHashMap<ProviderKey, Declaration> = FxHashMap::default();
			for declarable in &self.declarations {
				let key = declarable.declared_key().clone();
				let declaration = declarable.declare(this);
				if let Some(existing) = declared.get(&key) {
					if existing.type_id() != declaration.type_id() {
						conflict.get_or_insert(Error::DuplicateBinding {
							key: key.to_string(),
							existing: existing.type_name(),
							requested: declaration.type_name(),
						});
						continue;
					}
				}
				declared.insert(key, declaration);
			}

			ScopeInner {
				id,
				parent: self.parent.clone(),
				store,
				spawner,
				root: RefCell::new(None),
				state: RefCell::new(ScopeState {
					phase: Phase::Mounted,
					declared,
					families: FxHashSet::default(),
					edges: FxHashMap::default(),
					teardown: Vec::new(),
					children: Vec::new(),
					consumers: Vec::new(),
				}),
			}
		});
		let scope = Scope { inner };

		if let Some(err) = conflict {
			scope.dispose();
			return Err(err);
		}
		if let Err(err) = scope.inner.register_bindings() {
			scope.dispose();
			return Err(err);
		}
		if let Some(parent) = &self.parent {
			parent
				.inner
				.state
				.borrow_mut()
				.children
				.push(Rc::downgrade(&scope.inner));
		}

		tracing::debug!(scope = %scope.id(), parent = ?scope.parent().map(|p| p.id().to_owned()), "scope mounted");
		Ok(scope)
	}
}

impl Scope {
	pub fn builder() -> ScopeBuilder {
		ScopeBuilder {
			id: None,
			parent: None,
			store: None,
			spawner: None,
			declarations: Vec::new(),
		}
	}

	/// Builder for a nested scope. It inherits the store and spawner, and its
	/// declarations shadow this scope's for its own subtree.
	pub fn child(&self) -> ScopeBuilder {
		ScopeBuilder {
			parent: Some(self.clone()),
			..Scope::builder()
		}
	}

	pub fn id(&self) -> &str {
		&self.inner.id
	}

	pub fn parent(&self) -> Option<&Scope> {
		self.inner.parent.as_ref()
	}

	pub fn phase(&self) -> Phase {
		self.inner.state.borrow().phase
	}

	pub fn is_mounted(&self) -> bool {
		self.inner.is_mounted()
	}

	pub fn store(&self) -> &Rc<dyn InstanceStore> {
		&self.inner.store
	}

	pub(crate) fn downgrade(&self) -> Weak<ScopeInner> {
		Rc::downgrade(&self.inner)
	}

	pub(crate) fn upgrade(weak: &Weak<ScopeInner>) -> Option<Scope> {
		weak.upgrade().map(|inner| Scope { inner })
	}

	pub(crate) fn ensure_mounted(&self) -> Result<()> {
		if self.is_mounted() {
			Ok(())
		} else {
			Err(Error::ScopeDisposed {
				scope: self.id().to_owned(),
			})
		}
	}

	/// Creates a UI-side dependent. `on_change` runs whenever something it
	/// watches changes.
	pub fn consumer(&self, on_change: impl Fn() + 'static) -> Result<Consumer> {
		self.ensure_mounted()?;
		let consumer = Consumer {
			body: Rc::new(ConsumerBody {
				id: next_id(),
				scope: self.downgrade(),
				on_change: Box::new(on_change),
				owned: RefCell::new(Owned::default()),
				disposed: Cell::new(false),
			}),
		};
		self.inner
			.state
			.borrow_mut()
			.consumers
			.push(Rc::downgrade(&consumer.body));
		Ok(consumer)
	}

	/// Context of the scope's own consumer, which lives as long as the scope.
	pub fn context(&self) -> Result<Context> {
		self.ensure_mounted()?;
		if let Some(root) = &*self.inner.root.borrow() {
			return Ok(root.context());
		}
		let root = self.consumer(|| {})?;
		let cx = root.context();
		*self.inner.root.borrow_mut() = Some(root);
		Ok(cx)
	}

	pub fn read<P: ProviderBase>(&self, provider: &P) -> Result<P::Output> {
		self.context()?.read(provider)
	}

	pub fn unit<P: ProviderBase>(&self, provider: &P) -> Result<Unit<P::Value>> {
		self.context()?.unit(provider)
	}

	pub fn invalidate<P: ProviderBase>(&self, provider: &P) -> Result<()> {
		self.context()?.invalidate(provider)
	}

	pub fn refresh<P: ProviderBase>(&self, provider: &P) -> Result<P::Output> {
		self.context()?.refresh(provider)
	}

	/// Registers a callback run when the scope is disposed. On a scope that
	/// is already being torn down it runs right away.
	pub fn on_dispose(&self, func: impl FnOnce() + 'static) {
		{
			let mut state = self.inner.state.borrow_mut();
			if state.phase == Phase::Mounted {
				state.teardown.push(Box::new(func));
				return;
			}
		}
		func();
	}

	pub fn watch_edge_count(&self) -> usize {
		self.inner
			.state
			.borrow()
			.edges
			.values()
			.map(|edges| edges.len())
			.sum()
	}

	pub fn family_instance_count(&self) -> usize {
		self.inner.state.borrow().families.len()
	}

	/// Live consumers, the scope's own one included.
	pub fn consumer_count(&self) -> usize {
		self.inner.state.borrow().consumers.len()
	}

	pub fn child_count(&self) -> usize {
		self.inner.state.borrow().children.len()
	}

	/// Number of dependents currently watching the provider's unit.
	pub fn watcher_count<P: ProviderBase>(&self, provider: &P) -> Result<usize> {
		let node = self.resolve(provider, &self.context()?.owner())?;
		Ok(node.watcher_count())
	}

	/// Disposes the provider's unit in the scope that owns it and clears its
	/// watchers. The next read creates a fresh unit. Transient units belong to
	/// their dependents and are left alone.
	pub fn release<P: ProviderBase>(&self, provider: &P) -> Result<()> {
		self.ensure_mounted()?;
		let meta = provider.meta();
		let declared = meta.parent().unwrap_or(meta.key());
		let scope = self
			.declaring(declared)
			.ok_or_else(|| Error::not_available(meta.key()))?;
		scope.inner.release(meta)
	}

	/// Tears the scope down: nested scopes and consumers first, then teardown
	/// callbacks, watch edges and finally every owned unit. Idempotent.
	pub fn dispose(&self) {
		self.inner.teardown();
	}

	pub(crate) fn resolve<P: ProviderBase>(&self, provider: &P, owner: &Owner) -> Result<Rc<Node<P::Value>>> {
		self.ensure_mounted()?;
		let meta = provider.meta();

		let instance = match meta.parent() {
			Some(family) => {
				let scope = self
					.declaring(family)
					.ok_or_else(|| Error::not_available(meta.key()))?;
				scope.family_instance(meta)?
			}
			None => {
				let scope = self
					.declaring(meta.key())
					.ok_or_else(|| Error::not_available(meta.key()))?;
				if scope.is_kept_alive(meta.key()) {
					scope.singleton(meta.key())?
				} else {
					match owner.local(meta.key()) {
						Some(node) => Instance::from_node(node),
						None => {
							let instance = scope.singleton(meta.key())?;
							owner.cache_local(meta.key().clone(), instance.node().clone());
							instance
						}
					}
				}
			}
		};

		instance
			.node()
			.clone()
			.as_any()
			.downcast::<Node<P::Value>>()
			.map_err(|_| Error::Mismatch {
				provider: meta.key().to_string(),
				expected: std::any::type_name::<P::Value>(),
			})
	}

	/// Nearest scope, starting at this one, that declares `key`.
	fn declaring(&self, key: &ProviderKey) -> Option<Scope> {
		let mut current = Some(self.clone());
		while let Some(scope) = current {
			if scope.inner.state.borrow().declared.contains_key(key) {
				return Some(scope);
			}
			current = scope.inner.parent.clone();
		}
		None
	}

	fn is_kept_alive(&self, key: &ProviderKey) -> bool {
		matches!(
			self.inner.state.borrow().declared.get(key),
			Some(Declaration::Single { keep_alive: true, .. })
		)
	}

	fn singleton(&self, key: &ProviderKey) -> Result<Instance> {
		self.inner
			.store
			.get(&self.inner.qualify(key))
			.ok_or_else(|| Error::not_available(key))
	}

	fn family_instance(&self, meta: &Meta) -> Result<Instance> {
		let qualified = self.inner.qualify(meta.key());
		if let Some(instance) = self.inner.store.get(&qualified) {
			return Ok(instance);
		}

		let instantiate = {
			let state = self.inner.state.borrow();
			match meta.parent().and_then(|family| state.declared.get(family)) {
				Some(Declaration::Family { instantiate, .. }) => instantiate.clone(),
				_ => return Err(Error::not_available(meta.key())),
			}
		};
		let args = meta
			.family_args()
			.ok_or_else(|| Error::not_available(meta.key()))?;

		let binding = instantiate(args)?;
		self.inner.store.register_singleton(&qualified, binding)?;
		self.inner
			.state
			.borrow_mut()
			.families
			.insert(meta.key().clone());
		tracing::debug!(scope = %self.id(), unit = %meta.key(), "family instance registered");

		self.inner
			.store
			.get(&qualified)
			.ok_or_else(|| Error::not_available(meta.key()))
	}
}

impl ScopeInner {
	pub(crate) fn id(&self) -> &Rc<str> {
		&self.id
	}

	pub(crate) fn is_mounted(&self) -> bool {
		self.state.borrow().phase == Phase::Mounted
	}

	fn qualify(&self, key: &str) -> String {
		format!("{}::{}", self.id, key)
	}

	fn release(&self, meta: &Meta) -> Result<()> {
		let qualified = self.qualify(meta.key());
		let instance = if meta.parent().is_some() {
			self.state.borrow_mut().families.remove(meta.key());
			self.store.unregister(&qualified)
		} else {
			let binding = match self.state.borrow().declared.get(meta.key()) {
				Some(Declaration::Single {
					keep_alive: true,
					binding,
				}) => binding.clone(),
				_ => return Ok(()),
			};
			let instance = self.store.unregister(&qualified);
			self.store.register_singleton(&qualified, binding)?;
			instance
		};

		if let Some(instance) = instance {
			tracing::debug!(scope = %self.id, unit = %meta.key(), "unit released");
			instance.dispose();
		}
		Ok(())
	}

	fn register_bindings(&self) -> Result<()> {
		let bindings: Vec<_> = self
			.state
			.borrow()
			.declared
			.iter()
			.filter_map(|(key, declaration)| match declaration {
				Declaration::Single {
					keep_alive,
					binding,
				} => Some((self.qualify(key), *keep_alive, binding.clone())),
				Declaration::Family { .. } => None,
			})
			.collect();

		for (key, keep_alive, binding) in bindings {
			if keep_alive {
				self.store.register_singleton(&key, binding)?;
			} else {
				self.store.register_factory(&key, binding)?;
			}
		}
		Ok(())
	}

	/// Installs an edge, handing back the one it replaced.
	pub(crate) fn install_edge(&self, watcher: u64, key: EdgeKey, edge: Edge) -> Option<Edge> {
		let mut state = self.state.borrow_mut();
		if state.phase != Phase::Mounted {
			return Some(edge);
		}
		tracing::trace!(scope = %self.id, watcher, target = %key.target, kind = ?key.kind, "edge installed");
		state.edges.entry(watcher).or_default().insert(key, edge)
	}

	pub(crate) fn cancel_edges(&self, watcher: u64) {
		let removed = match self.state.try_borrow_mut() {
			Ok(mut state) => state.edges.remove(&watcher),
			Err(_) => None,
		};
		if let Some(edges) = removed {
			tracing::trace!(scope = %self.id, watcher, count = edges.len(), "edges cancelled");
		}
	}

	pub(crate) fn forget_consumer(&self, consumer: &ConsumerBody) {
		if let Ok(mut state) = self.state.try_borrow_mut() {
			state
				.consumers
				.retain(|entry| !std::ptr::eq(entry.as_ptr(), consumer));
		}
	}

	pub(crate) fn spawn<T: Clone + 'static>(&self, pending: Pending<T>) {
		if let Some(spawner) = &self.spawner {
			spawner(pending.map(drop).boxed_local());
		}
	}

	fn teardown(&self) {
		let (children, consumers) = {
			let mut state = self.state.borrow_mut();
			if state.phase != Phase::Mounted {
				return;
			}
			state.phase = Phase::Disposing;
			(
				std::mem::take(&mut state.children),
				std::mem::take(&mut state.consumers),
			)
		};
		tracing::debug!(scope = %self.id, "disposing scope");

		if let Some(parent) = &self.parent {
			if let Ok(mut state) = parent.inner.state.try_borrow_mut() {
				state.children.retain(|child| !std::ptr::eq(child.as_ptr(), self));
			}
		}

		for child in children.iter().filter_map(Weak::upgrade) {
			child.teardown();
		}
		for consumer in consumers.iter().filter_map(Weak::upgrade) {
			consumer.dispose();
		}
		let root = self.root.borrow_mut().take();
		drop(root);

		let callbacks = std::mem::take(&mut self.state.borrow_mut().teardown);
		for callback in callbacks {
			callback();
		}

		let edges = std::mem::take(&mut self.state.borrow_mut().edges);
		drop(edges);

		let keys: Vec<String> = {
			let state = self.state.borrow();
			state
				.declared
				.iter()
				.filter(|(_, declaration)| matches!(declaration, Declaration::Single { .. }))
				.map(|(key, _)| key)
				.chain(state.families.iter())
				.map(|key| self.qualify(key))
				.collect()
		};
		for key in keys {
			if let Some(instance) = self.store.unregister(&key) {
				instance.dispose();
			}
		}

		self.store.release_scope(&self.id);

		let mut state = self.state.borrow_mut();
		state.families.clear();
		state.phase = Phase::Disposed;
		tracing::debug!(scope = %self.id, "scope disposed");
	}
}

impl Drop for ScopeInner {
	fn drop(&mut self) {
		self.teardown();
	}
}

impl Debug for Scope {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scope")
			.field("id", &self.id())
			.field("phase", &self.phase())
			.finish()
	}
}

/// A UI-side dependent: caches transient units it reads and is notified
/// through `on_change` when anything it watches changes.
pub struct Consumer {
	body: Rc<ConsumerBody>,
}

pub struct ConsumerBody {
	id: u64,
	scope: Weak<ScopeInner>,
	on_change: Box<dyn Fn()>,
	owned: RefCell<Owned>,
	disposed: Cell<bool>,
}

impl Consumer {
	pub fn id(&self) -> u64 {
		self.body.id
	}

	pub fn context(&self) -> Context {
		Context::for_consumer(self.body.scope.clone(), self.body.id, Rc::downgrade(&self.body))
	}

	pub fn is_disposed(&self) -> bool {
		self.body.disposed.get()
	}

	pub fn dispose(&self) {
		self.body.dispose()
	}
}

impl ConsumerBody {
	pub(crate) fn notify(&self) {
		if !self.disposed.get() {
			(self.on_change)()
		}
	}

	pub(crate) fn owned(&self) -> &RefCell<Owned> {
		&self.owned
	}

	pub(crate) fn is_disposed(&self) -> bool {
		self.disposed.get()
	}

	fn dispose(&self) {
		if self.disposed.replace(true) {
			return;
		}
		tracing::trace!(consumer = self.id, "consumer disposed");

		if let Some(scope) = self.scope.upgrade() {
			scope.cancel_edges(self.id);
			scope.forget_consumer(self);
		}
		let (disposers, locals) = {
			let mut owned = self.owned.borrow_mut();
			(owned.take_disposers(), owned.take_locals())
		};
		for disposer in disposers {
			disposer();
		}
		for local in locals {
			local.dispose();
		}
	}
}

impl Drop for ConsumerBody {
	fn drop(&mut self) {
		self.dispose();
	}
}

impl Debug for Consumer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Consumer")
			.field("id", &self.body.id)
			.field("disposed", &self.body.disposed.get())
			.finish()
	}
}
