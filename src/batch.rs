use std::cell::{Cell, RefCell};
use std::rc::Weak;

use crate::error::{Error, Result};
use crate::node::AnyNode;

thread_local! {
	static STARTED: Cell<bool> = const { Cell::new(false) };
	static QUEUED: RefCell<Vec<Weak<dyn AnyNode>>> = const { RefCell::new(Vec::new()) };
}

/// Whether a change is being broadcast right now.
pub(crate) fn in_batch() -> bool {
	STARTED.with(Cell::get)
}

/// Returns `true` for the outermost broadcast, which has to call [`run`].
pub(crate) fn start() -> bool {
	STARTED.with(|started| !started.replace(true))
}

pub(crate) fn stop() {
	STARTED.with(|started| started.set(false));
}

/// Queues a rebuild until the current broadcast has reached every listener,
/// so no dependent is rebuilt from inputs that are about to be invalidated.
pub(crate) fn defer(node: Weak<dyn AnyNode>) {
	QUEUED.with(|queued| queued.borrow_mut().push(node));
}

/// Rebuilds queued units until nothing is left. Changes made by the rebuilds
/// queue their own dependents onto the same run. Every unit is attempted;
/// the first failure is returned.
pub(crate) fn run() -> Result<()> {
	let mut failure = None;
	loop {
		let queued = QUEUED.with(|queued| std::mem::take(&mut *queued.borrow_mut()));
		if queued.is_empty() {
			break;
		}

		for node in queued.iter().filter_map(Weak::upgrade) {
			let key = node.key().to_string();
			if let Err(source) = node.rebuild() {
				tracing::warn!(unit = %key, error = %source, "deferred rebuild failed");
				failure.get_or_insert(Error::Invalidation {
					watcher: key,
					source: Box::new(source),
				});
			}
		}
	}

	match failure {
		Some(err) => Err(err),
		None => Ok(()),
	}
}
