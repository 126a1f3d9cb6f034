use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::unit::Unit;

pub(crate) type SyncBuild<T> = Rc<dyn Fn(&Context) -> anyhow::Result<T>>;
pub(crate) type AsyncBuild<T> = Rc<dyn Fn(Context) -> LocalBoxFuture<'static, anyhow::Result<T>>>;

pub(crate) enum Build<T> {
	Sync(SyncBuild<T>),
	Async(AsyncBuild<T>),
}

impl<T> Clone for Build<T> {
	fn clone(&self) -> Self {
		match self {
			Build::Sync(build) => Build::Sync(build.clone()),
			Build::Async(build) => Build::Async(build.clone()),
		}
	}
}

/// Lifecycle of a computed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Uncomputed,
	Computing,
	Settled,
}

enum Memo<T> {
	Uncomputed,
	/// A synchronous build, or the synchronous part of an asynchronous one,
	/// is on the stack right now.
	Building,
	Pending(Pending<T>),
	Settled(T),
}

/// An in-flight (or already resolved) asynchronous result.
///
/// Clones share the same underlying computation, so every reader that
/// arrives during the pending window awaits the same build.
pub struct Pending<T> {
	inner: PendingInner<T>,
}

enum PendingInner<T> {
	Ready(Rc<Result<T>>),
	Shared(Shared<LocalBoxFuture<'static, Result<T>>>),
}

impl<T> Clone for Pending<T> {
	fn clone(&self) -> Self {
		let inner = match &self.inner {
			PendingInner::Ready(result) => PendingInner::Ready(result.clone()),
			PendingInner::Shared(future) => PendingInner::Shared(future.clone()),
		};
		Pending { inner }
	}
}

impl<T> Pending<T>
where
	T: Clone + 'static,
{
	pub(crate) fn new(future: impl Future<Output = Result<T>> + 'static) -> Self {
		Pending {
			inner: PendingInner::Shared(future.boxed_local().shared()),
		}
	}

	pub fn ready(result: Result<T>) -> Self {
		Pending {
			inner: PendingInner::Ready(Rc::new(result)),
		}
	}

	/// The result, if the computation already finished.
	pub fn peek(&self) -> Option<&Result<T>> {
		match &self.inner {
			PendingInner::Ready(result) => Some(&**result),
			PendingInner::Shared(future) => future.peek(),
		}
	}

	pub fn is_ready(&self) -> bool {
		self.peek().is_some()
	}
}

impl<T> Future for Pending<T>
where
	T: Clone,
{
	type Output = Result<T>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
		match &mut self.inner {
			PendingInner::Ready(result) => Poll::Ready((**result).clone()),
			PendingInner::Shared(future) => future.poll_unpin(cx),
		}
	}
}

impl<T> Debug for Pending<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let ready = match &self.inner {
			PendingInner::Ready(_) => true,
			PendingInner::Shared(future) => future.peek().is_some(),
		};
		f.debug_struct("Pending").field("ready", &ready).finish()
	}
}

pub(crate) enum Reset {
	Idle { was_active: bool },
	Building,
}

/// Memoized build state mixed onto a [`Unit`].
///
/// The memo is cleared by [`Computation::reset`]; every reset bumps the
/// generation so results of builds started before it are never cached.
pub(crate) struct Computation<T> {
	label: Rc<str>,
	build: Build<T>,
	memo: RefCell<Memo<T>>,
	generation: Cell<u64>,
}

impl<T> Computation<T>
where
	T: Clone + 'static,
{
	pub fn new(label: Rc<str>, build: Build<T>) -> Rc<Self> {
		Rc::new(Computation {
			label,
			build,
			memo: RefCell::new(Memo::Uncomputed),
			generation: Cell::new(0),
		})
	}

	pub fn is_async(&self) -> bool {
		matches!(self.build, Build::Async(_))
	}

	pub fn status(&self) -> Status {
		match &*self.memo.borrow() {
			Memo::Uncomputed => Status::Uncomputed,
			Memo::Building | Memo::Pending(_) => Status::Computing,
			Memo::Settled(_) => Status::Settled,
		}
	}

	fn reentered(&self) -> Error {
		Error::CircularDependency {
			path: vec![self.label.to_string(), self.label.to_string()],
		}
	}

	/// Runs a synchronous build unless a result is cached.
	///
	/// `context` is only called when a build actually starts.
	pub fn trigger(&self, unit: &Unit<T>, context: impl FnOnce() -> Result<Context>) -> Result<T> {
		let build = match &self.build {
			Build::Sync(build) => build.clone(),
			Build::Async(_) => {
				return Err(Error::Mismatch {
					provider: self.label.to_string(),
					expected: "a synchronous build",
				})
			}
		};

		{
			let mut memo = self.memo.borrow_mut();
			match &*memo {
				Memo::Settled(value) => return Ok(value.clone()),
				Memo::Building | Memo::Pending(_) => return Err(self.reentered()),
				Memo::Uncomputed => *memo = Memo::Building,
			}
		}

		let generation = self.generation.get();
		let cx = match context() {
			Ok(cx) => cx,
			Err(err) => {
				self.abandon();
				return Err(err);
			}
		};

		tracing::debug!(unit = %self.label, generation, "build started");
		let result = build(&cx);
		self.settle(generation, unit, result)
	}

	/// Starts an asynchronous build unless one is cached or in flight, in
	/// which case the same shared result is returned.
	pub fn trigger_async(
		self: &Rc<Self>,
		unit: &Unit<T>,
		context: impl FnOnce() -> Result<Context>,
	) -> Result<Pending<T>> {
		let build = match &self.build {
			Build::Async(build) => build.clone(),
			Build::Sync(_) => {
				return Err(Error::Mismatch {
					provider: self.label.to_string(),
					expected: "an asynchronous build",
				})
			}
		};

		{
			let mut memo = self.memo.borrow_mut();
			match &*memo {
				Memo::Settled(value) => return Ok(Pending::ready(Ok(value.clone()))),
				Memo::Pending(pending) => return Ok(pending.clone()),
				Memo::Building => return Err(self.reentered()),
				Memo::Uncomputed => *memo = Memo::Building,
			}
		}

		let generation = self.generation.get();
		let cx = match context() {
			Ok(cx) => cx,
			Err(err) => {
				self.abandon();
				return Err(err);
			}
		};

		tracing::debug!(unit = %self.label, generation, "async build started");
		let future = build(cx);
		let this = Rc::downgrade(self);
		let label = self.label.clone();
		let unit = unit.clone();
		let pending = Pending::new(async move {
			let result = future.await;
			match this.upgrade() {
				Some(this) => this.settle(generation, &unit, result),
				None => result.map_err(|cause| Error::build(&label, cause)),
			}
		});

		let mut memo = self.memo.borrow_mut();
		if self.generation.get() == generation {
			*memo = Memo::Pending(pending.clone());
		} else if matches!(&*memo, Memo::Building) {
			*memo = Memo::Uncomputed;
		}

		Ok(pending)
	}

	fn abandon(&self) {
		let mut memo = self.memo.borrow_mut();
		if matches!(&*memo, Memo::Building) {
			*memo = Memo::Uncomputed;
		}
	}

	fn settle(&self, generation: u64, unit: &Unit<T>, result: anyhow::Result<T>) -> Result<T> {
		let current = self.generation.get() == generation;

		let value = match result {
			Ok(value) => value,
			Err(cause) => {
				if current {
					*self.memo.borrow_mut() = Memo::Uncomputed;
				} else {
					self.abandon();
				}
				tracing::warn!(unit = %self.label, error = %cause, "build failed");
				return Err(Error::build(&self.label, cause));
			}
		};

		if !current || unit.is_closed() {
			if current {
				*self.memo.borrow_mut() = Memo::Uncomputed;
			} else {
				self.abandon();
			}
			tracing::debug!(unit = %self.label, generation, "dropping stale result");
			return Ok(value);
		}

		*self.memo.borrow_mut() = Memo::Settled(value.clone());
		tracing::debug!(unit = %self.label, generation, "build settled");
		// Dependents report their own failures when they are read.
		if let Err(err) = unit.set(value.clone()) {
			tracing::warn!(unit = %self.label, error = %err, "failed to notify dependents");
		}
		Ok(value)
	}

	/// Forgets the cached result.
	pub fn reset(&self) -> Reset {
		self.generation.set(self.generation.get() + 1);

		let previous = {
			let mut memo = self.memo.borrow_mut();
			match &*memo {
				Memo::Building => return Reset::Building,
				Memo::Uncomputed => return Reset::Idle { was_active: false },
				_ => std::mem::replace(&mut *memo, Memo::Uncomputed),
			}
		};
		drop(previous);

		Reset::Idle { was_active: true }
	}
}
