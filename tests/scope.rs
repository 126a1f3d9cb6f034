use std::cell::Cell;
use std::rc::Rc;

use mockall::predicate::eq;
use providence::{Error, Phase, Provider, Registry, Scope, StateProvider, Status};

use crate::mock::{self, Spy};

#[test]
fn kept_alive_units_are_shared() {
	crate::init_tracing();

	let counter = StateProvider::named("counter", || 0u64);
	let scope = Scope::builder().provide(counter.clone()).mount().unwrap();

	let first = scope.unit(&counter).unwrap();
	let consumer = scope.consumer(|| {}).unwrap();
	let second = consumer.context().unit(&counter).unwrap();

	assert!(first.ptr_eq(&second));
	assert_eq!(consumer.context().read(&counter).unwrap(), 0);
}

#[test]
fn transient_units_belong_to_their_consumer() {
	let item = StateProvider::named("item", || 1u32).transient();
	let scope = Scope::builder().provide(item.clone()).mount().unwrap();

	let a = scope.consumer(|| {}).unwrap();
	let b = scope.consumer(|| {}).unwrap();

	let from_a = a.context().unit(&item).unwrap();
	let again = a.context().unit(&item).unwrap();
	let from_b = b.context().unit(&item).unwrap();

	assert!(from_a.ptr_eq(&again));
	assert!(!from_a.ptr_eq(&from_b));

	a.dispose();
	assert!(from_a.is_closed());
	assert!(!from_b.is_closed());

	let fresh = scope.consumer(|| {}).unwrap();
	assert!(!fresh.context().unit(&item).unwrap().ptr_eq(&from_a));
}

#[test]
fn settled_units_do_not_rebuild() {
	let builds = Rc::new(Cell::new(0));
	let answer = Provider::new({
		let builds = builds.clone();
		move |_| {
			builds.set(builds.get() + 1);
			Ok(42u32)
		}
	});
	let scope = Scope::builder().provide(answer.clone()).mount().unwrap();

	assert_eq!(scope.context().unwrap().status(&answer).unwrap(), Status::Uncomputed);
	assert_eq!(scope.read(&answer).unwrap(), 42);
	assert_eq!(scope.read(&answer).unwrap(), 42);
	assert_eq!(scope.read(&answer).unwrap(), 42);

	assert_eq!(builds.get(), 1);
	assert_eq!(scope.context().unwrap().status(&answer).unwrap(), Status::Settled);
}

#[test]
fn watched_change_rebuilds_once_before_any_read() {
	let mock = mock::SharedMock::new();

	let source = StateProvider::named("source", || 1u64);
	let derived = Provider::named("derived", {
		let source = source.clone();
		let mock = mock.clone();
		move |cx| {
			let value = cx.watch(&source)?;
			mock.get().trigger(value);
			Ok(value * 10)
		}
	});
	let scope = Scope::builder()
		.provide(source.clone())
		.provide(derived.clone())
		.mount()
		.unwrap();

	mock.get().expect_trigger().with(eq(1)).times(1).return_const(());
	assert_eq!(scope.read(&derived).unwrap(), 10);
	mock.get().checkpoint();

	mock.get().expect_trigger().with(eq(5)).times(1).return_const(());
	scope.unit(&source).unwrap().set(5).unwrap();
	mock.get().checkpoint();

	assert_eq!(scope.unit(&derived).unwrap().get(), Some(50));
	assert_eq!(scope.read(&derived).unwrap(), 50);
}

#[test]
fn sum_follows_watched_inputs() {
	let x = StateProvider::named("x", || 2i64);
	let y = StateProvider::named("y", || 3i64);

	let builds = Rc::new(Cell::new(0));
	let sum = Provider::named("sum", {
		let (x, y, builds) = (x.clone(), y.clone(), builds.clone());
		move |cx| {
			builds.set(builds.get() + 1);
			Ok(cx.watch(&x)? + cx.watch(&y)?)
		}
	});
	let scope = Scope::builder()
		.provide(x.clone())
		.provide(y.clone())
		.provide(sum.clone())
		.mount()
		.unwrap();

	assert_eq!(scope.read(&sum).unwrap(), 5);
	assert_eq!(builds.get(), 1);

	scope.unit(&x).unwrap().set(10).unwrap();
	assert_eq!(builds.get(), 2);
	assert_eq!(scope.unit(&sum).unwrap().get(), Some(13));
	assert_eq!(scope.read(&sum).unwrap(), 13);
	assert_eq!(builds.get(), 2);

	scope.unit(&y).unwrap().set(4).unwrap();
	assert_eq!(scope.read(&sum).unwrap(), 14);
	assert_eq!(builds.get(), 3);
}

#[test]
fn read_does_not_subscribe() {
	let x = StateProvider::new(|| 2i64);
	let y = StateProvider::new(|| 3i64);

	let builds = Rc::new(Cell::new(0));
	let partial = Provider::new({
		let (x, y, builds) = (x.clone(), y.clone(), builds.clone());
		move |cx| {
			builds.set(builds.get() + 1);
			Ok(cx.watch(&x)? + cx.read(&y)?)
		}
	});
	let scope = Scope::builder()
		.provide(x.clone())
		.provide(y.clone())
		.provide(partial.clone())
		.mount()
		.unwrap();

	assert_eq!(scope.read(&partial).unwrap(), 5);

	scope.unit(&y).unwrap().set(100).unwrap();
	assert_eq!(builds.get(), 1);
	assert_eq!(scope.read(&partial).unwrap(), 5);

	scope.unit(&x).unwrap().set(10).unwrap();
	assert_eq!(builds.get(), 2);
	assert_eq!(scope.read(&partial).unwrap(), 110);
}

#[test]
fn undeclared_provider_is_not_available() {
	let missing = StateProvider::named("missing", || ());
	let scope = Scope::builder().mount().unwrap();

	let err = scope.read(&missing).unwrap_err();
	assert!(matches!(err, Error::ProviderNotAvailable { ref provider } if provider.starts_with("missing#")));
}

#[test]
fn later_declaration_overrides_earlier() {
	let api = Provider::named("api", |_| Ok("live".to_string()));
	let scope = Scope::builder()
		.provide(api.clone())
		.provide(api.override_with_value("fake".to_string()))
		.mount()
		.unwrap();

	assert_eq!(scope.read(&api).unwrap(), "fake");
}

#[test]
fn child_overrides_shadow_parent() {
	let api = Provider::named("api", |_| Ok("live".to_string()));
	let greeting = Provider::named("greeting", {
		let api = api.clone();
		move |cx| Ok(format!("hello {}", cx.watch(&api)?))
	});

	let parent = Scope::builder()
		.provide(api.clone())
		.provide(greeting.clone())
		.mount()
		.unwrap();
	let child = parent
		.child()
		.provide(api.override_with_value("fake".to_string()))
		.provide(greeting.clone())
		.mount()
		.unwrap();
	let plain = parent.child().mount().unwrap();

	assert_eq!(child.read(&greeting).unwrap(), "hello fake");
	assert_eq!(parent.read(&greeting).unwrap(), "hello live");
	assert_eq!(plain.read(&greeting).unwrap(), "hello live");
	assert!(plain.unit(&greeting).unwrap().ptr_eq(&parent.unit(&greeting).unwrap()));
}

#[test]
fn disposing_parent_disposes_children() {
	let counter = StateProvider::new(|| 0u8);
	let store = Registry::shared();
	let parent = Scope::builder()
		.id("parent")
		.store(store.clone())
		.provide(counter.clone())
		.mount()
		.unwrap();
	let child = parent.child().id("child").provide(counter.clone()).mount().unwrap();

	let unit = child.unit(&counter).unwrap();
	assert_eq!(store.len(), 2);

	parent.dispose();

	assert_eq!(parent.phase(), Phase::Disposed);
	assert_eq!(child.phase(), Phase::Disposed);
	assert!(unit.is_closed());
	assert!(store.is_empty());
	assert!(matches!(unit.set(1), Err(Error::ClosedUnit { .. })));
	assert!(matches!(child.read(&counter), Err(Error::ScopeDisposed { ref scope }) if scope == "child"));
	assert!(parent.child().mount().is_err());
}

#[test]
fn teardown_runs_callbacks_once() {
	let calls = Rc::new(Cell::new(0));
	let scope = Scope::builder().mount().unwrap();
	scope.on_dispose({
		let calls = calls.clone();
		move || calls.set(calls.get() + 1)
	});

	scope.dispose();
	scope.dispose();
	assert_eq!(calls.get(), 1);
}

#[test]
fn build_failure_is_not_cached() {
	let attempts = Rc::new(Cell::new(0));
	let flaky = Provider::named("flaky", {
		let attempts = attempts.clone();
		move |_| {
			attempts.set(attempts.get() + 1);
			if attempts.get() == 1 {
				anyhow::bail!("backend unavailable");
			}
			Ok(attempts.get())
		}
	});
	let scope = Scope::builder().provide(flaky.clone()).mount().unwrap();

	let err = scope.read(&flaky).unwrap_err();
	assert!(err.is_build_failure());
	assert!(err.to_string().contains("backend unavailable"));
	assert_eq!(scope.context().unwrap().status(&flaky).unwrap(), Status::Uncomputed);

	assert_eq!(scope.read(&flaky).unwrap(), 2);
	assert_eq!(scope.read(&flaky).unwrap(), 2);
}

#[test]
fn failing_dependent_surfaces_from_set() {
	let source = StateProvider::named("source", || 1u32);
	let picky = Provider::named("picky", {
		let source = source.clone();
		move |cx| {
			let value = cx.watch(&source)?;
			anyhow::ensure!(value != 13, "unlucky number");
			Ok(value)
		}
	});
	let scope = Scope::builder()
		.provide(source.clone())
		.provide(picky.clone())
		.mount()
		.unwrap();

	assert_eq!(scope.read(&picky).unwrap(), 1);

	let err = scope.unit(&source).unwrap().set(13).unwrap_err();
	assert!(matches!(err, Error::Invalidation { ref watcher, .. } if watcher.starts_with("picky#")));
	assert!(err.is_build_failure());
	assert_eq!(scope.unit(&source).unwrap().get(), Some(13));

	scope.unit(&source).unwrap().set(2).unwrap();
	assert_eq!(scope.read(&picky).unwrap(), 2);
}

#[test]
fn released_units_start_over() {
	let count = StateProvider::named("count", || 0u32);
	let label = Provider::named("label", {
		let count = count.clone();
		move |cx| Ok(format!("count {}", cx.watch(&count)?))
	});
	let scope = Scope::builder()
		.provide(count.clone())
		.provide(label.clone())
		.mount()
		.unwrap();

	let before = scope.unit(&count).unwrap();
	before.set(3).unwrap();
	assert_eq!(scope.read(&label).unwrap(), "count 3");
	assert_eq!(scope.watcher_count(&count).unwrap(), 1);

	scope.release(&count).unwrap();

	assert!(before.is_closed());
	let after = scope.unit(&count).unwrap();
	assert!(!after.ptr_eq(&before));
	assert_eq!(scope.context().unwrap().status(&label).unwrap(), Status::Uncomputed);
	assert_eq!(scope.read(&label).unwrap(), "count 0");
}

#[test]
fn computed_chain_settles_once_and_follows_changes() {
	let a = StateProvider::named("a", || 1u32);
	let b_builds = Rc::new(Cell::new(0));
	let b = Provider::named("b", {
		let (a, builds) = (a.clone(), b_builds.clone());
		move |cx| {
			builds.set(builds.get() + 1);
			Ok(cx.watch(&a)? * 10)
		}
	});
	let d_builds = Rc::new(Cell::new(0));
	let d = Provider::named("d", {
		let (b, builds) = (b.clone(), d_builds.clone());
		move |cx| {
			builds.set(builds.get() + 1);
			Ok(cx.watch(&b)? + 1)
		}
	});
	let scope = Scope::builder()
		.provide(a.clone())
		.provide(b.clone())
		.provide(d.clone())
		.mount()
		.unwrap();

	for _ in 0..3 {
		assert_eq!(scope.read(&d).unwrap(), 11);
	}
	assert_eq!(d_builds.get(), 1);
	assert_eq!(b_builds.get(), 1);
	assert_eq!(scope.context().unwrap().status(&d).unwrap(), Status::Settled);

	scope.unit(&a).unwrap().set(2).unwrap();
	assert_eq!(scope.unit(&b).unwrap().get(), Some(20));
	assert_eq!(scope.unit(&d).unwrap().get(), Some(21));
	assert_eq!(d_builds.get(), 2);

	assert_eq!(scope.read(&d).unwrap(), 21);
	assert_eq!(d_builds.get(), 2);
	assert_eq!(b_builds.get(), 2);
}

#[test]
fn diamond_rebuilds_once_from_fresh_inputs() {
	let a = StateProvider::named("a", || 1u32);
	let b = Provider::named("b", {
		let a = a.clone();
		move |cx| Ok(cx.watch(&a)? * 10)
	});
	let c = Provider::named("c", {
		let a = a.clone();
		move |cx| Ok(cx.watch(&a)? + 1)
	});
	let inputs = Rc::new(std::cell::RefCell::new(Vec::new()));
	let d = Provider::named("d", {
		let (b, c, inputs) = (b.clone(), c.clone(), inputs.clone());
		move |cx| {
			let (b, c) = (cx.watch(&b)?, cx.watch(&c)?);
			inputs.borrow_mut().push((b, c));
			Ok(b + c)
		}
	});
	let scope = Scope::builder()
		.provide(a.clone())
		.provide(b.clone())
		.provide(c.clone())
		.provide(d.clone())
		.mount()
		.unwrap();

	assert_eq!(scope.read(&d).unwrap(), 12);

	let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
	let consumer = scope.consumer(|| {}).unwrap();
	consumer
		.context()
		.listen(&d, {
			let seen = seen.clone();
			move |_, next| seen.borrow_mut().push(*next)
		})
		.unwrap();

	scope.unit(&a).unwrap().set(2).unwrap();

	assert_eq!(*inputs.borrow(), vec![(10, 2), (20, 3)]);
	assert_eq!(*seen.borrow(), vec![23]);
	assert_eq!(scope.read(&d).unwrap(), 23);
	assert_eq!(inputs.borrow().len(), 2);
}

#[test]
fn on_dispose_after_teardown_runs_immediately() {
	let scope = Scope::builder().mount().unwrap();
	scope.dispose();

	let ran = Rc::new(Cell::new(false));
	scope.on_dispose({
		let ran = ran.clone();
		move || ran.set(true)
	});
	assert!(ran.get());
}

#[test]
fn scope_ids_are_exclusive_per_store() {
	let store = Registry::shared();
	let value = StateProvider::named("value", || 1u32);

	let first = Scope::builder()
		.id("x")
		.store(store.clone())
		.provide(value.clone())
		.mount()
		.unwrap();
	let err = Scope::builder()
		.id("x")
		.store(store.clone())
		.provide(value.override_with_value(2))
		.mount()
		.unwrap_err();

	assert!(matches!(err, Error::ScopeMounted { ref scope } if scope == "x"));
	assert_eq!(first.read(&value).unwrap(), 1);

	let elsewhere = Scope::builder().id("x").provide(value.override_with_value(3)).mount().unwrap();
	assert_eq!(elsewhere.read(&value).unwrap(), 3);
	assert_eq!(first.read(&value).unwrap(), 1);

	first.dispose();
	let second = Scope::builder()
		.id("x")
		.store(store.clone())
		.provide(value.override_with_value(2))
		.mount()
		.unwrap();
	assert_eq!(second.read(&value).unwrap(), 2);
}

#[test]
fn dropped_consumers_and_children_are_forgotten() {
	let scope = Scope::builder().mount().unwrap();

	for _ in 0..100 {
		let consumer = scope.consumer(|| {}).unwrap();
		drop(consumer);
	}
	assert_eq!(scope.consumer_count(), 0);

	let kept = scope.consumer(|| {}).unwrap();
	let disposed = scope.consumer(|| {}).unwrap();
	disposed.dispose();
	assert_eq!(scope.consumer_count(), 1);

	for _ in 0..10 {
		let child = scope.child().mount().unwrap();
		drop(child);
	}
	assert_eq!(scope.child_count(), 0);

	let child = scope.child().mount().unwrap();
	assert_eq!(scope.child_count(), 1);
	child.dispose();
	assert_eq!(scope.child_count(), 0);
	assert!(!kept.is_disposed());
}
