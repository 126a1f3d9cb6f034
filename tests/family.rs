use providence::{Error, InstanceStore, Provider, Registry, Scope, StateProvider};

#[test]
fn equal_arguments_share_an_instance() {
	let user = Provider::family(|_, id: &u32| Ok(format!("user-{id}")));
	let scope = Scope::builder().provide(user.clone()).mount().unwrap();

	let one = scope.unit(&user.call(1)).unwrap();
	let again = scope.unit(&user.call(1)).unwrap();
	let two = scope.unit(&user.call(2)).unwrap();

	assert!(one.ptr_eq(&again));
	assert!(!one.ptr_eq(&two));
	assert_eq!(scope.read(&user.call(1)).unwrap(), "user-1");
	assert_eq!(scope.read(&user.call(2)).unwrap(), "user-2");
	assert_eq!(scope.family_instance_count(), 2);
}

#[test]
fn family_instances_watch_their_inputs() {
	let factor = StateProvider::named("factor", || 2u32);
	let scaled = Provider::family({
		let factor = factor.clone();
		move |cx, value: &u32| Ok(cx.watch(&factor)? * value)
	});
	let scope = Scope::builder()
		.provide(factor.clone())
		.provide(scaled.clone())
		.mount()
		.unwrap();

	assert_eq!(scope.read(&scaled.call(5)).unwrap(), 10);
	assert_eq!(scope.read(&scaled.call(7)).unwrap(), 14);
	assert_eq!(scope.watcher_count(&factor).unwrap(), 2);

	scope.unit(&factor).unwrap().set(3).unwrap();
	assert_eq!(scope.unit(&scaled.call(5)).unwrap().get(), Some(15));
	assert_eq!(scope.unit(&scaled.call(7)).unwrap().get(), Some(21));
}

#[test]
fn disposed_family_instances_are_not_resurrected() {
	let store = Registry::shared();
	let base = StateProvider::named("base", || 1u32);
	let multiplied = Provider::family({
		let base = base.clone();
		move |cx, factor: &u32| Ok(cx.watch(&base)? * factor)
	});
	let key = format!("screen::{}", multiplied.call(3).key());

	let mount = || {
		Scope::builder()
			.id("screen")
			.store(store.clone())
			.provide(base.clone())
			.provide(multiplied.clone())
			.mount()
			.unwrap()
	};

	let scope = mount();
	let first = scope.unit(&multiplied.call(3)).unwrap();
	assert_eq!(scope.read(&multiplied.call(3)).unwrap(), 3);
	scope.unit(&base).unwrap().set(2).unwrap();
	assert_eq!(first.get(), Some(6));

	assert_eq!(scope.watch_edge_count(), 1);
	assert!(store.is_registered(&key));

	scope.dispose();

	assert!(first.is_closed());
	assert_eq!(scope.watch_edge_count(), 0);
	assert_eq!(scope.family_instance_count(), 0);
	assert!(!store.is_registered(&key));
	assert!(store.is_empty());
	assert!(matches!(scope.read(&multiplied.call(3)), Err(Error::ScopeDisposed { .. })));

	let remounted = mount();
	let second = remounted.unit(&multiplied.call(3)).unwrap();
	assert!(!second.ptr_eq(&first));
	assert_eq!(second.get(), None);
	assert_eq!(remounted.read(&multiplied.call(3)).unwrap(), 3);
}

#[test]
fn family_override_applies_per_scope() {
	let user = Provider::family(|_, id: &u32| Ok(format!("user-{id}")));
	let parent = Scope::builder().provide(user.clone()).mount().unwrap();
	let child = parent
		.child()
		.provide(user.override_with(|id: &u32| {
			let id = *id;
			Provider::new(move |_| Ok(format!("fake-{id}")))
		}))
		.mount()
		.unwrap();

	assert_eq!(child.read(&user.call(7)).unwrap(), "fake-7");
	assert_eq!(parent.read(&user.call(7)).unwrap(), "user-7");
	assert_eq!(child.family_instance_count(), 1);
	assert_eq!(parent.family_instance_count(), 1);
}

#[test]
fn state_families_hold_independent_values() {
	let draft = StateProvider::family(|id: &&'static str| format!("draft for {id}"));
	let scope = Scope::builder().provide(draft.clone()).mount().unwrap();

	scope
		.unit(&draft.call("alice"))
		.unwrap()
		.set("edited".to_string())
		.unwrap();

	assert_eq!(scope.read(&draft.call("alice")).unwrap(), "edited");
	assert_eq!(scope.read(&draft.call("bob")).unwrap(), "draft for bob");
}

#[test]
fn released_family_instance_is_recreated() {
	let user = Provider::family(|_, id: &u32| Ok(format!("user-{id}")));
	let scope = Scope::builder().provide(user.clone()).mount().unwrap();

	let first = scope.unit(&user.call(1)).unwrap();
	assert_eq!(scope.read(&user.call(1)).unwrap(), "user-1");

	scope.release(&user.call(1)).unwrap();
	assert!(first.is_closed());
	assert_eq!(scope.family_instance_count(), 0);

	let second = scope.unit(&user.call(1)).unwrap();
	assert!(!second.ptr_eq(&first));
	assert_eq!(scope.read(&user.call(1)).unwrap(), "user-1");
	assert_eq!(scope.family_instance_count(), 1);
}
