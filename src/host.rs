use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use fxhash::FxHashMap;

use crate::error::{Error, Result};
use crate::provider::Declarable;
use crate::registry::{InstanceStore, Registry};
use crate::scope::{Scope, Spawner};

/// Mount and unmount hooks for UI glue. Keeps every mounted container by id,
/// backed by one shared instance store.
pub struct Host {
	store: Rc<dyn InstanceStore>,
	spawner: Option<Spawner>,
	scopes: RefCell<FxHashMap<Rc<str>, Scope>>,
}

impl Default for Host {
	fn default() -> Self {
		Host::new(Registry::shared())
	}
}

impl Host {
	pub fn new(store: Rc<dyn InstanceStore>) -> Self {
		Host {
			store,
			spawner: None,
			scopes: RefCell::new(FxHashMap::default()),
		}
	}

	pub fn with_spawner(mut self, spawner: impl Fn(LocalBoxFuture<'static, ()>) + 'static) -> Self {
		self.spawner = Some(Rc::new(spawner));
		self
	}

	/// Mounts a container. `parent` names an already mounted container whose
	/// declarations the new one inherits.
	pub fn on_scope_mount(
		&self,
		id: &str,
		parent: Option<&str>,
		providers: Vec<Box<dyn Declarable>>,
	) -> Result<Scope> {
		if self.get(id).map_or(false, |existing| existing.is_mounted()) {
			return Err(Error::ScopeMounted { scope: id.to_owned() });
		}

		let builder = match parent {
			Some(parent) => self
				.get(parent)
				.ok_or_else(|| Error::ScopeDisposed {
					scope: parent.to_owned(),
				})?
				.child(),
			None => Scope::builder(),
		};
		let mut builder = builder.id(id).store(self.store.clone()).provide_all(providers);
		if let Some(spawner) = &self.spawner {
			let spawner = spawner.clone();
			builder = builder.spawner(move |future| spawner(future));
		}

		let scope = builder.mount()?;
		self.scopes.borrow_mut().insert(id.into(), scope.clone());
		Ok(scope)
	}

	/// Disposes the container and every container mounted under it.
	pub fn on_scope_unmount(&self, id: &str) -> Result<()> {
		let scope = self
			.scopes
			.borrow_mut()
			.remove(id)
			.ok_or_else(|| Error::ScopeDisposed { scope: id.to_owned() })?;
		scope.dispose();

		self.scopes.borrow_mut().retain(|_, scope| scope.is_mounted());
		tracing::debug!(scope = id, "scope unmounted");
		Ok(())
	}

	pub fn get(&self, id: &str) -> Option<Scope> {
		self.scopes.borrow().get(id).cloned()
	}

	pub fn mounted(&self) -> Vec<Rc<str>> {
		let mut ids: Vec<_> = self.scopes.borrow().keys().cloned().collect();
		ids.sort();
		ids
	}
}
