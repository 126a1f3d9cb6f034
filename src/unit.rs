use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::batch;
use crate::error::{Error, Result};

type Listener<T> = Rc<dyn Fn(&Change<T>) -> Result<()>>;

/// A change broadcast by [`Unit::set`].
///
/// `previous` is `None` when the unit had no value yet, which happens for
/// computed units until their first build settles.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
	pub previous: Option<T>,
	pub next: T,
}

/// The runtime instance behind a provider: a current value plus a
/// synchronous change broadcast.
pub struct Unit<T> {
	pub(crate) body: Rc<UnitBody<T>>,
}

impl<T> Clone for Unit<T> {
	fn clone(&self) -> Self {
		Self {
			body: self.body.clone(),
		}
	}
}

pub(crate) struct UnitBody<T> {
	label: Rc<str>,
	value: RefCell<Option<T>>,
	inner: RefCell<UnitInner<T>>,
}

struct UnitInner<T> {
	next_id: u64,
	closed: bool,
	subscribers: SmallVec<[(u64, Listener<T>); 4]>,
}

impl<T> Unit<T>
where
	T: Clone + 'static,
{
	pub fn new(label: impl Into<Rc<str>>, value: T) -> Self {
		Self::with_value(label.into(), Some(value))
	}

	pub(crate) fn empty(label: Rc<str>) -> Self {
		Self::with_value(label, None)
	}

	fn with_value(label: Rc<str>, value: Option<T>) -> Self {
		Unit {
			body: Rc::new(UnitBody {
				label,
				value: RefCell::new(value),
				inner: RefCell::new(UnitInner {
					next_id: 0,
					closed: false,
					subscribers: SmallVec::new(),
				}),
			}),
		}
	}

	pub fn label(&self) -> &str {
		&self.body.label
	}

	/// Current value, `None` while a computed unit has never settled.
	pub fn get(&self) -> Option<T> {
		self.body.value.borrow().clone()
	}

	pub fn with<R>(&self, func: impl FnOnce(&T) -> R) -> Option<R> {
		self.body.value.borrow().as_ref().map(func)
	}

	pub fn is_closed(&self) -> bool {
		self.body.inner.borrow().closed
	}

	/// Replaces the value and notifies every subscriber, in subscription
	/// order, before returning.
	///
	/// All subscribers are notified even if one of them fails; the first
	/// failure is returned.
	pub fn set(&self, value: T) -> Result<()> {
		let listeners = {
			let inner = self.body.inner.borrow();
			if inner.closed {
				return Err(Error::ClosedUnit {
					unit: self.label().to_owned(),
				});
			}
			inner.subscribers.clone()
		};

		let previous = self.body.value.replace(Some(value.clone()));
		let change = Change {
			previous,
			next: value,
		};

		let is_root = batch::start();
		let mut failure = None;
		for (id, listener) in listeners {
			// A listener may have been cancelled by an earlier one in this round.
			if !self.body.is_subscribed(id) {
				continue;
			}
			if let Err(err) = listener(&change) {
				failure.get_or_insert(err);
			}
		}
		if is_root {
			let rebuilt = batch::run();
			batch::stop();
			if let Err(err) = rebuilt {
				failure.get_or_insert(err);
			}
		}

		match failure {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Applies `func` to a copy of the current value and sets the result.
	pub fn update(&self, func: impl FnOnce(&mut T)) -> Result<()> {
		if self.is_closed() {
			return Err(Error::ClosedUnit {
				unit: self.label().to_owned(),
			});
		}
		let Some(mut value) = self.get() else {
			return Err(Error::Unsettled {
				unit: self.label().to_owned(),
			});
		};
		func(&mut value);
		self.set(value)
	}

	/// Registers a listener for future changes only.
	#[must_use = "dropping the subscription unsubscribes the listener"]
	pub fn subscribe(&self, listener: impl Fn(&Change<T>) -> Result<()> + 'static) -> Subscription {
		let mut inner = self.body.inner.borrow_mut();
		let id = inner.next_id;
		inner.next_id += 1;
		if !inner.closed {
			inner.subscribers.push((id, Rc::new(listener)));
		}

		let unit: Rc<dyn Unsubscribe> = self.body.clone();
		Subscription {
			id,
			unit: Rc::downgrade(&unit),
		}
	}

	pub fn unsubscribe(&self, subscription: Subscription) {
		subscription.cancel();
	}

	pub fn subscriber_count(&self) -> usize {
		self.body.inner.borrow().subscribers.len()
	}

	/// Closes the broadcast. Later calls to [`Unit::set`] fail with
	/// [`Error::ClosedUnit`].
	pub fn dispose(&self) {
		let dropped = {
			let mut inner = self.body.inner.borrow_mut();
			inner.closed = true;
			std::mem::take(&mut inner.subscribers)
		};
		tracing::trace!(unit = %self.label(), listeners = dropped.len(), "unit closed");
	}

	pub fn ptr_eq(&self, other: &Unit<T>) -> bool {
		Rc::ptr_eq(&self.body, &other.body)
	}
}

impl<T> UnitBody<T> {
	fn is_subscribed(&self, id: u64) -> bool {
		self.inner
			.borrow()
			.subscribers
			.iter()
			.any(|(item, _)| *item == id)
	}
}

trait Unsubscribe {
	fn unsubscribe(&self, id: u64);
}

impl<T> Unsubscribe for UnitBody<T> {
	fn unsubscribe(&self, id: u64) {
		// Dropped outside of the borrow: a listener may own other subscriptions.
		let removed = {
			let mut inner = self.inner.borrow_mut();
			let position = inner.subscribers.iter().position(|(item, _)| *item == id);
			position.map(|index| inner.subscribers.remove(index))
		};
		drop(removed);
	}
}

/// Handle returned by [`Unit::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
	id: u64,
	unit: Weak<dyn Unsubscribe>,
}

impl Subscription {
	pub fn cancel(self) {
		drop(self)
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(unit) = self.unit.upgrade() {
			unit.unsubscribe(self.id);
		}
	}
}

impl Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription").field("id", &self.id).finish()
	}
}

impl<T> Debug for Unit<T>
where
	T: Debug,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Unit")
			.field("label", &self.body.label)
			.field("value", &self.body.value.borrow())
			.finish()
	}
}
