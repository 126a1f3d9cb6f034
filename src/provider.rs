use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::FutureExt;

use crate::computable::{AsyncBuild, Build, Pending, SyncBuild};
use crate::context::Context;
use crate::error::Result;
use crate::family::Family;
use crate::node::{AnyNode, Node};
use crate::registry::Binding;
use crate::scope::{Declaration, ScopeInner};

/// Stable identity of a provider declaration. Family instances derive theirs
/// from the family key and their arguments.
pub type ProviderKey = Rc<str>;

static NEXT_PROVIDER: AtomicU64 = AtomicU64::new(1);

fn declare_key(name: &str) -> ProviderKey {
	let id = NEXT_PROVIDER.fetch_add(1, Ordering::Relaxed);
	format!("{name}#{id}").into()
}

/// Arguments a family instance was created with.
#[derive(Clone)]
pub struct FamilyArgs {
	pub(crate) canonical: Rc<str>,
	pub(crate) value: Rc<dyn Any>,
}

/// Descriptor shared by every provider kind.
#[derive(Clone)]
pub struct Meta {
	key: ProviderKey,
	name: Option<Rc<str>>,
	keep_alive: bool,
	parent: Option<ProviderKey>,
	args: Option<FamilyArgs>,
	overridden: bool,
}

impl Meta {
	pub(crate) fn new(name: Option<&str>) -> Self {
		Meta {
			key: declare_key(name.unwrap_or("provider")),
			name: name.map(Into::into),
			keep_alive: true,
			parent: None,
			args: None,
			overridden: false,
		}
	}

	pub fn key(&self) -> &ProviderKey {
		&self.key
	}

	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Kept-alive units live as long as their scope; transient ones as long
	/// as the dependent that first read them.
	pub fn keep_alive(&self) -> bool {
		self.keep_alive
	}

	/// Key of the family this provider was instantiated from.
	pub fn parent(&self) -> Option<&ProviderKey> {
		self.parent.as_ref()
	}

	/// Canonical form of the bound family arguments.
	pub fn args(&self) -> Option<&str> {
		self.args.as_ref().map(|args| &*args.canonical)
	}

	pub fn is_override(&self) -> bool {
		self.overridden
	}

	pub(crate) fn family_args(&self) -> Option<&FamilyArgs> {
		self.args.as_ref()
	}

	pub(crate) fn overriding(&self) -> Self {
		Meta {
			overridden: true,
			..self.clone()
		}
	}

	pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
		self.keep_alive = keep_alive;
	}

	/// Rebinds an instance descriptor to `family` and its arguments.
	pub(crate) fn bind(&mut self, family: &Meta, canonical: Rc<str>, value: Rc<dyn Any>) {
		self.key = format!("{}({})", family.key, canonical).into();
		self.name = family.name.clone();
		self.keep_alive = true;
		self.parent = Some(family.key.clone());
		self.args = Some(FamilyArgs { canonical, value });
		self.overridden = family.overridden;
	}
}

impl Debug for Meta {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Meta")
			.field("key", &self.key)
			.field("keep_alive", &self.keep_alive)
			.field("parent", &self.parent)
			.field("args", &self.args())
			.field("overridden", &self.overridden)
			.finish()
	}
}

/// Something a [`Context`] can read and watch.
///
/// Implemented by [`StateProvider`], [`Provider`] and [`FutureProvider`].
pub trait ProviderBase: Clone + 'static {
	/// Value held by the backing unit.
	type Value: Clone + 'static;
	/// What `read` and `watch` return.
	type Output;

	fn meta(&self) -> &Meta;

	#[doc(hidden)]
	fn meta_mut(&mut self) -> &mut Meta;

	#[doc(hidden)]
	fn create(&self, scope: &Weak<ScopeInner>) -> Rc<Node<Self::Value>>;

	#[doc(hidden)]
	fn output(node: &Rc<Node<Self::Value>>, cx: &Context) -> Result<Self::Output>;

	#[doc(hidden)]
	fn binding(&self, scope: &Weak<ScopeInner>) -> Binding {
		let provider = self.clone();
		let scope = scope.clone();
		Binding::new::<Self>(move || provider.create(&scope) as Rc<dyn AnyNode>)
	}
}

/// Anything a scope can declare: a provider or a family.
pub trait Declarable {
	fn declared_key(&self) -> &ProviderKey;

	#[doc(hidden)]
	fn declare(&self, scope: &Weak<ScopeInner>) -> Declaration;
}

/// A plain value source. The factory produces the initial value.
pub struct StateProvider<T> {
	meta: Meta,
	factory: Rc<dyn Fn() -> T>,
}

/// A computed value with a synchronous build.
pub struct Provider<T> {
	meta: Meta,
	factory: SyncBuild<T>,
}

/// A computed value with an asynchronous build.
pub struct FutureProvider<T> {
	meta: Meta,
	factory: AsyncBuild<T>,
}

macro_rules! impl_provider {
	($ty:ident) => {
		impl<T> Clone for $ty<T> {
			fn clone(&self) -> Self {
				$ty {
					meta: self.meta.clone(),
					factory: self.factory.clone(),
				}
			}
		}

		impl<T> $ty<T>
		where
			T: Clone + 'static,
		{
			/// Gives each dependent its own unit instead of one per scope.
			pub fn transient(mut self) -> Self {
				self.meta.set_keep_alive(false);
				self
			}

			pub fn keep_alive(mut self, keep_alive: bool) -> Self {
				self.meta.set_keep_alive(keep_alive);
				self
			}

			pub fn key(&self) -> &ProviderKey {
				self.meta.key()
			}
		}

		impl<T> Declarable for $ty<T>
		where
			T: Clone + 'static,
		{
			fn declared_key(&self) -> &ProviderKey {
				self.meta.key()
			}

			fn declare(&self, scope: &Weak<ScopeInner>) -> Declaration {
				Declaration::Single {
					keep_alive: self.meta.keep_alive(),
					binding: self.binding(scope),
				}
			}
		}

		impl<T> Debug for $ty<T> {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				f.debug_tuple(stringify!($ty)).field(&self.meta).finish()
			}
		}
	};
}

impl_provider!(StateProvider);
impl_provider!(Provider);
impl_provider!(FutureProvider);

impl<T> StateProvider<T>
where
	T: Clone + 'static,
{
	pub fn new(init: impl Fn() -> T + 'static) -> Self {
		StateProvider {
			meta: Meta::new(None),
			factory: Rc::new(init),
		}
	}

	pub fn named(name: &str, init: impl Fn() -> T + 'static) -> Self {
		StateProvider {
			meta: Meta::new(Some(name)),
			factory: Rc::new(init),
		}
	}

	pub fn override_with(&self, init: impl Fn() -> T + 'static) -> Self {
		StateProvider {
			meta: self.meta.overriding(),
			factory: Rc::new(init),
		}
	}

	pub fn override_with_value(&self, value: T) -> Self {
		self.override_with(move || value.clone())
	}

	pub fn family<A>(init: impl Fn(&A) -> T + 'static) -> Family<A, Self>
	where
		A: Clone + Debug + 'static,
	{
		let init = Rc::new(init);
		Family::new(move |args: &A| {
			let init = init.clone();
			let args = args.clone();
			StateProvider::new(move || init(&args))
		})
	}
}

impl<T> ProviderBase for StateProvider<T>
where
	T: Clone + 'static,
{
	type Value = T;
	type Output = T;

	fn meta(&self) -> &Meta {
		&self.meta
	}

	fn meta_mut(&mut self) -> &mut Meta {
		&mut self.meta
	}

	fn create(&self, scope: &Weak<ScopeInner>) -> Rc<Node<T>> {
		Node::plain(self.meta.clone(), self.factory.clone(), scope.clone())
	}

	fn output(node: &Rc<Node<T>>, cx: &Context) -> Result<T> {
		node.value(cx)
	}
}

impl<T> Provider<T>
where
	T: Clone + 'static,
{
	pub fn new(build: impl Fn(&Context) -> anyhow::Result<T> + 'static) -> Self {
		Provider {
			meta: Meta::new(None),
			factory: Rc::new(build),
		}
	}

	pub fn named(name: &str, build: impl Fn(&Context) -> anyhow::Result<T> + 'static) -> Self {
		Provider {
			meta: Meta::new(Some(name)),
			factory: Rc::new(build),
		}
	}

	pub fn override_with(&self, build: impl Fn(&Context) -> anyhow::Result<T> + 'static) -> Self {
		Provider {
			meta: self.meta.overriding(),
			factory: Rc::new(build),
		}
	}

	pub fn override_with_value(&self, value: T) -> Self {
		self.override_with(move |_| Ok(value.clone()))
	}

	pub fn family<A>(build: impl Fn(&Context, &A) -> anyhow::Result<T> + 'static) -> Family<A, Self>
	where
		A: Clone + Debug + 'static,
	{
		let build = Rc::new(build);
		Family::new(move |args: &A| {
			let build = build.clone();
			let args = args.clone();
			Provider::new(move |cx| build(cx, &args))
		})
	}
}

impl<T> ProviderBase for Provider<T>
where
	T: Clone + 'static,
{
	type Value = T;
	type Output = T;

	fn meta(&self) -> &Meta {
		&self.meta
	}

	fn meta_mut(&mut self) -> &mut Meta {
		&mut self.meta
	}

	fn create(&self, scope: &Weak<ScopeInner>) -> Rc<Node<T>> {
		Node::computed(self.meta.clone(), Build::Sync(self.factory.clone()), scope.clone())
	}

	fn output(node: &Rc<Node<T>>, cx: &Context) -> Result<T> {
		node.value(cx)
	}
}

fn boxed<T, F, Fut>(build: F) -> AsyncBuild<T>
where
	F: Fn(Context) -> Fut + 'static,
	Fut: Future<Output = anyhow::Result<T>> + 'static,
{
	Rc::new(move |cx| build(cx).boxed_local())
}

impl<T> FutureProvider<T>
where
	T: Clone + 'static,
{
	pub fn new<F, Fut>(build: F) -> Self
	where
		F: Fn(Context) -> Fut + 'static,
		Fut: Future<Output = anyhow::Result<T>> + 'static,
	{
		FutureProvider {
			meta: Meta::new(None),
			factory: boxed(build),
		}
	}

	pub fn named<F, Fut>(name: &str, build: F) -> Self
	where
		F: Fn(Context) -> Fut + 'static,
		Fut: Future<Output = anyhow::Result<T>> + 'static,
	{
		FutureProvider {
			meta: Meta::new(Some(name)),
			factory: boxed(build),
		}
	}

	pub fn override_with<F, Fut>(&self, build: F) -> Self
	where
		F: Fn(Context) -> Fut + 'static,
		Fut: Future<Output = anyhow::Result<T>> + 'static,
	{
		FutureProvider {
			meta: self.meta.overriding(),
			factory: boxed(build),
		}
	}

	pub fn override_with_value(&self, value: T) -> Self {
		self.override_with(move |_| futures::future::ready(Ok(value.clone())))
	}

	pub fn family<A, F, Fut>(build: F) -> Family<A, Self>
	where
		A: Clone + Debug + 'static,
		F: Fn(Context, A) -> Fut + 'static,
		Fut: Future<Output = anyhow::Result<T>> + 'static,
	{
		let build = Rc::new(build);
		Family::new(move |args: &A| {
			let build = build.clone();
			let args = args.clone();
			FutureProvider::new(move |cx| build(cx, args.clone()))
		})
	}
}

impl<T> ProviderBase for FutureProvider<T>
where
	T: Clone + 'static,
{
	type Value = T;
	type Output = Pending<T>;

	fn meta(&self) -> &Meta {
		&self.meta
	}

	fn meta_mut(&mut self) -> &mut Meta {
		&mut self.meta
	}

	fn create(&self, scope: &Weak<ScopeInner>) -> Rc<Node<T>> {
		Node::computed(self.meta.clone(), Build::Async(self.factory.clone()), scope.clone())
	}

	fn output(node: &Rc<Node<T>>, cx: &Context) -> Result<Pending<T>> {
		node.pending(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn declarations_get_distinct_keys() {
		let a = StateProvider::named("counter", || 0);
		let b = StateProvider::named("counter", || 0);

		assert_ne!(a.key(), b.key());
		assert!(a.key().starts_with("counter#"));
		assert_eq!(a.clone().key(), a.key());
	}

	#[test]
	fn overrides_keep_identity() {
		let base = Provider::named("answer", |_| Ok(1));
		let replaced = base.override_with_value(42);

		assert_eq!(base.key(), replaced.key());
		assert!(replaced.meta().is_override());
		assert!(!base.meta().is_override());
	}

	#[test]
	fn transient_flag() {
		let provider = StateProvider::new(|| 1u8);
		assert!(provider.meta().keep_alive());
		assert!(!provider.transient().meta().keep_alive());
	}
}
