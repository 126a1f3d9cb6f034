use std::any::{type_name, TypeId};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

use fxhash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::node::AnyNode;

/// A unit instance held by an [`InstanceStore`].
#[derive(Clone)]
pub struct Instance {
	node: Rc<dyn AnyNode>,
}

impl Instance {
	pub fn key(&self) -> &str {
		self.node.key()
	}

	pub fn ptr_eq(&self, other: &Instance) -> bool {
		Rc::ptr_eq(&self.node, &other.node)
	}

	pub fn is_disposed(&self) -> bool {
		self.node.is_disposed()
	}

	pub(crate) fn from_node(node: Rc<dyn AnyNode>) -> Self {
		Instance { node }
	}

	pub(crate) fn node(&self) -> &Rc<dyn AnyNode> {
		&self.node
	}

	pub(crate) fn dispose(self) {
		self.node.dispose()
	}
}

impl Debug for Instance {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Instance").field(&self.key()).finish()
	}
}

/// How to create instances for one key, tagged with the provider type so
/// conflicting registrations can be detected.
#[derive(Clone)]
pub struct Binding {
	type_id: TypeId,
	type_name: &'static str,
	factory: Rc<dyn Fn() -> Rc<dyn AnyNode>>,
}

impl Binding {
	pub(crate) fn new<P: 'static>(factory: impl Fn() -> Rc<dyn AnyNode> + 'static) -> Self {
		Binding {
			type_id: TypeId::of::<P>(),
			type_name: type_name::<P>(),
			factory: Rc::new(factory),
		}
	}

	pub fn type_id(&self) -> TypeId {
		self.type_id
	}

	pub fn type_name(&self) -> &'static str {
		self.type_name
	}

	pub fn create(&self) -> Instance {
		Instance {
			node: (self.factory)(),
		}
	}
}

impl Debug for Binding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Binding").field(&self.type_name).finish()
	}
}

/// Keyed instance cache shared by scopes.
///
/// Scopes qualify every key with their own id, so one store can back any
/// number of containers.
pub trait InstanceStore {
	/// Registers a lazily created instance that lives until unregistered.
	fn register_singleton(&self, key: &str, binding: Binding) -> Result<()>;

	/// Registers a binding that creates a fresh instance on every `get`.
	fn register_factory(&self, key: &str, binding: Binding) -> Result<()>;

	fn get(&self, key: &str) -> Option<Instance>;

	fn is_registered(&self, key: &str) -> bool;

	/// Removes the binding and hands back the singleton, if it was created.
	fn unregister(&self, key: &str) -> Option<Instance>;

	/// Reserves `scope` as a key prefix. Returns `false` while another live
	/// scope holds it.
	fn claim_scope(&self, scope: &str) -> bool;

	fn release_scope(&self, scope: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifetime {
	Singleton,
	Factory,
}

struct Slot {
	binding: Binding,
	lifetime: Lifetime,
	instance: Option<Instance>,
}

/// The default in-memory [`InstanceStore`].
#[derive(Default)]
pub struct Registry {
	slots: RefCell<FxHashMap<String, Slot>>,
	scopes: RefCell<FxHashSet<String>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn shared() -> Rc<Self> {
		Rc::new(Self::new())
	}

	pub fn len(&self) -> usize {
		self.slots.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.borrow().is_empty()
	}

	pub fn keys(&self) -> Vec<String> {
		let mut keys: Vec<_> = self.slots.borrow().keys().cloned().collect();
		keys.sort();
		keys
	}

	fn register(&self, key: &str, binding: Binding, lifetime: Lifetime) -> Result<()> {
		let mut slots = self.slots.borrow_mut();

		if let Some(slot) = slots.get_mut(key) {
			if slot.binding.type_id != binding.type_id {
				return Err(Error::DuplicateBinding {
					key: key.to_owned(),
					existing: slot.binding.type_name,
					requested: binding.type_name,
				});
			}
			if slot.instance.is_none() {
				slot.binding = binding;
				slot.lifetime = lifetime;
			}
			return Ok(());
		}

		tracing::trace!(key, ?lifetime, "binding registered");
		slots.insert(
			key.to_owned(),
			Slot {
				binding,
				lifetime,
				instance: None,
			},
		);
		Ok(())
	}
}

impl InstanceStore for Registry {
	fn register_singleton(&self, key: &str, binding: Binding) -> Result<()> {
		self.register(key, binding, Lifetime::Singleton)
	}

	fn register_factory(&self, key: &str, binding: Binding) -> Result<()> {
		self.register(key, binding, Lifetime::Factory)
	}

	fn get(&self, key: &str) -> Option<Instance> {
		let (binding, lifetime) = {
			let slots = self.slots.borrow();
			let slot = slots.get(key)?;
			if let Some(instance) = &slot.instance {
				return Some(instance.clone());
			}
			(slot.binding.clone(), slot.lifetime)
		};

		// Factories may run user code, so no borrow is held while creating.
		let instance = binding.create();

		if lifetime == Lifetime::Singleton {
			let mut slots = self.slots.borrow_mut();
			if let Some(slot) = slots.get_mut(key) {
				match &slot.instance {
					Some(existing) => return Some(existing.clone()),
					None => slot.instance = Some(instance.clone()),
				}
			}
		}

		Some(instance)
	}

	fn is_registered(&self, key: &str) -> bool {
		self.slots.borrow().contains_key(key)
	}

	fn unregister(&self, key: &str) -> Option<Instance> {
		let slot = self.slots.borrow_mut().remove(key)?;
		tracing::trace!(key, "binding unregistered");
		slot.instance
	}

	fn claim_scope(&self, scope: &str) -> bool {
		self.scopes.borrow_mut().insert(scope.to_owned())
	}

	fn release_scope(&self, scope: &str) {
		self.scopes.borrow_mut().remove(scope);
	}
}
