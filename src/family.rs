use std::any::{type_name, TypeId};
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::provider::{Declarable, FamilyArgs, Meta, ProviderBase, ProviderKey};
use crate::registry::Binding;
use crate::scope::{Declaration, ScopeInner};

/// A provider parameterized by arguments.
///
/// Calling the family with equal arguments yields providers with equal keys,
/// so they resolve to the same unit within the scope that declares the family.
/// Instances are always kept alive for the lifetime of that scope.
pub struct Family<A, P> {
	meta: Meta,
	make: Rc<dyn Fn(&A) -> P>,
}

impl<A, P> Clone for Family<A, P> {
	fn clone(&self) -> Self {
		Family {
			meta: self.meta.clone(),
			make: self.make.clone(),
		}
	}
}

impl<A, P> Family<A, P>
where
	A: Clone + Debug + 'static,
	P: ProviderBase,
{
	pub fn new(make: impl Fn(&A) -> P + 'static) -> Self {
		Family {
			meta: Meta::new(Some("family")),
			make: Rc::new(make),
		}
	}

	pub fn named(name: &str, make: impl Fn(&A) -> P + 'static) -> Self {
		Family {
			meta: Meta::new(Some(name)),
			make: Rc::new(make),
		}
	}

	pub fn meta(&self) -> &Meta {
		&self.meta
	}

	pub fn key(&self) -> &ProviderKey {
		self.meta.key()
	}

	/// The provider for `args`. Its key is the family key followed by the
	/// `Debug` rendering of the arguments.
	pub fn call(&self, args: A) -> P {
		let mut provider = (self.make)(&args);
		let canonical: Rc<str> = format!("{args:?}").into();
		provider.meta_mut().bind(&self.meta, canonical, Rc::new(args));
		provider
	}

	/// Same family key, different providers per argument.
	pub fn override_with(&self, make: impl Fn(&A) -> P + 'static) -> Self {
		Family {
			meta: self.meta.overriding(),
			make: Rc::new(make),
		}
	}
}

impl<A, P> Declarable for Family<A, P>
where
	A: Clone + Debug + 'static,
	P: ProviderBase,
{
	fn declared_key(&self) -> &ProviderKey {
		self.meta.key()
	}

	fn declare(&self, scope: &Weak<ScopeInner>) -> Declaration {
		let family = self.clone();
		let scope = scope.clone();
		Declaration::Family {
			type_id: TypeId::of::<Family<A, P>>(),
			type_name: type_name::<Family<A, P>>(),
			instantiate: Rc::new(move |args: &FamilyArgs| -> Result<Binding> {
				let value = args.value.downcast_ref::<A>().ok_or_else(|| Error::Mismatch {
					provider: family.meta.key().to_string(),
					expected: type_name::<A>(),
				})?;
				Ok(family.call(value.clone()).binding(&scope))
			}),
		}
	}
}

impl<A, P> Debug for Family<A, P> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Family").field(&self.meta).finish()
	}
}

#[cfg(test)]
mod tests {
	use crate::provider::{Provider, ProviderBase, StateProvider};

	#[test]
	fn instance_keys_are_derived_from_arguments() {
		let family = Provider::family(|_, id: &u32| Ok(*id * 2));

		let first = family.call(1);
		let again = family.call(1);
		let other = family.call(2);

		assert_eq!(first.key(), again.key());
		assert_ne!(first.key(), other.key());
		assert_eq!(&**first.key(), format!("{}(1)", family.key()));
		assert_eq!(first.meta().parent(), Some(family.key()));
		assert_eq!(first.meta().args(), Some("1"));
		assert!(first.meta().keep_alive());
	}

	#[test]
	fn string_arguments_use_debug_form() {
		let family = StateProvider::family(|name: &String| name.len());
		let instance = family.call("abc".to_string());
		assert_eq!(instance.meta().args(), Some("\"abc\""));
	}
}
