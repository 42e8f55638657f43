#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde::{Deserialize, Serialize};

    use crate::reactive;
    use crate::*;

    type Counter = Rc<std::cell::Cell<usize>>;

    fn counter() -> Counter {
        Rc::new(std::cell::Cell::new(0))
    }

    fn bump(c: &Counter) {
        c.set(c.get() + 1);
    }

    #[test]
    fn test_batched_writes_recompose_once() {
        let rc = Recomposer::default();
        let renders = counter();
        let a = cell(0);
        let b = cell(0);

        rc.mount({
            let (renders, a, b) = (renders.clone(), a.clone(), b.clone());
            move || {
                bump(&renders);
                let _sum = a.get() + b.get();
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(renders.get(), 1);

        a.set(1);
        a.set(2);
        b.set(3);
        let report = rc.tick();
        assert_eq!(report.recomposed, 1);
        assert_eq!(renders.get(), 2);

        // Nothing changed since.
        let report = rc.tick();
        assert_eq!(report.recomposed, 0);
        assert_eq!(renders.get(), 2);
    }

    #[test]
    fn test_stale_dependencies_are_pruned() {
        let rc = Recomposer::default();
        let renders = counter();
        let use_a = cell(true);
        let a = cell(0);
        let b = cell(0);

        rc.mount({
            let (renders, use_a, a, b) = (renders.clone(), use_a.clone(), a.clone(), b.clone());
            move || {
                bump(&renders);
                let _v = if use_a.get() { a.get() } else { b.get() };
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(reactive::subscriber_count(a.id()), 1);
        assert_eq!(reactive::subscriber_count(b.id()), 0);

        use_a.set(false);
        rc.tick();
        assert_eq!(renders.get(), 2);
        assert_eq!(reactive::subscriber_count(a.id()), 0);

        a.set(10);
        assert_eq!(rc.tick().recomposed, 0);
        assert_eq!(renders.get(), 2);

        b.set(10);
        assert_eq!(rc.tick().recomposed, 1);
        assert_eq!(renders.get(), 3);
    }

    #[test]
    fn test_plain_variable_never_recomposes() {
        let rc = Recomposer::default();
        let renders = counter();
        let shown = Rc::new(RefCell::new(Vec::new()));
        let click: Rc<RefCell<Option<Box<dyn FnMut()>>>> = Rc::new(RefCell::new(None));

        rc.mount({
            let (renders, shown, click) = (renders.clone(), shown.clone(), click.clone());
            move || {
                bump(&renders);
                let mut counter = 0;
                shown.borrow_mut().push(counter);
                *click.borrow_mut() = Some(Box::new(move || counter += 1));
                Ok(())
            }
        })
        .unwrap();

        for _ in 0..10 {
            if let Some(f) = click.borrow_mut().as_mut() {
                f();
            }
        }
        assert!(rc.is_idle());
        assert_eq!(rc.tick().recomposed, 0);
        assert_eq!(renders.get(), 1);
        assert_eq!(*shown.borrow(), vec![0]);
    }

    #[test]
    fn test_unretained_cell_resets_on_every_render() {
        let rc = Recomposer::default();
        let shown = Rc::new(RefCell::new(Vec::new()));
        let handle: Rc<RefCell<Option<Cell<i32>>>> = Rc::new(RefCell::new(None));

        rc.mount({
            let (shown, handle) = (shown.clone(), handle.clone());
            move || {
                let counter = cell(0);
                shown.borrow_mut().push(counter.get());
                *handle.borrow_mut() = Some(counter);
                Ok(())
            }
        })
        .unwrap();

        for _ in 0..3 {
            let c = handle.borrow().clone().unwrap();
            c.update(|v| *v += 1);
            assert_eq!(c.get_untracked(), 1);
            rc.tick();
        }
        // Every write re-rendered the node, which built a fresh cell at 0.
        assert_eq!(*shown.borrow(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_retained_cell_survives_recomposition() {
        let rc = Recomposer::default();
        let shown = Rc::new(RefCell::new(Vec::new()));
        let handle: Rc<RefCell<Option<Cell<i32>>>> = Rc::new(RefCell::new(None));

        rc.mount({
            let (shown, handle) = (shown.clone(), handle.clone());
            move || {
                let counter = retain("counter", || 0);
                shown.borrow_mut().push(counter.get());
                *handle.borrow_mut() = Some(counter);
                Ok(())
            }
        })
        .unwrap();

        for _ in 0..3 {
            let c = handle.borrow().clone().unwrap();
            c.update(|v| *v += 1);
            rc.tick();
        }
        assert_eq!(*shown.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_retain_identity_across_recomposition_and_recreation() {
        let rc = Recomposer::default();
        let show = cell(true);
        let trigger = cell(0);
        let seen: Rc<RefCell<Vec<Cell<i32>>>> = Rc::new(RefCell::new(Vec::new()));

        rc.mount({
            let (show, trigger, seen) = (show.clone(), trigger.clone(), seen.clone());
            move || {
                if show.get() {
                    let (trigger, seen) = (trigger.clone(), seen.clone());
                    child("counter", move || {
                        let _t = trigger.get();
                        seen.borrow_mut().push(retain("count", || 0));
                        Ok(())
                    })?;
                }
                Ok(())
            }
        })
        .unwrap();

        seen.borrow()[0].set(7);
        trigger.set(1);
        rc.tick();
        {
            let seen = seen.borrow();
            assert_eq!(seen.len(), 2);
            assert!(seen[0].ptr_eq(&seen[1]));
            assert_eq!(seen[1].get_untracked(), 7);
        }

        show.set(false);
        rc.tick();
        assert_eq!(rc.node_count(), 1);
        show.set(true);
        rc.tick();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].ptr_eq(&seen[2]));
        assert_eq!(seen[2].get_untracked(), 0);
    }

    fn persistent_counter(
        handle: Rc<RefCell<Option<Cell<i32>>>>,
    ) -> impl Fn() -> anyhow::Result<()> + 'static {
        move || {
            let c = retain_persistent("count", || 0)?;
            *handle.borrow_mut() = Some(c);
            Ok(())
        }
    }

    #[test]
    fn test_persistent_slot_round_trips_through_bundle() {
        let handle: Rc<RefCell<Option<Cell<i32>>>> = Rc::new(RefCell::new(None));

        let rc = Recomposer::default();
        rc.mount(persistent_counter(handle.clone())).unwrap();
        handle.borrow().as_ref().unwrap().set(5);
        let teardown = rc.unmount();
        assert_eq!(teardown.bundle.get("root#count"), Some(&BundleValue::Int(5)));

        // Process death: only the serialized bundle comes back.
        let json = teardown.finish().to_json().unwrap();
        let rc2 = Recomposer::default().with_bundle(Bundle::from_json(&json).unwrap());
        rc2.mount(persistent_counter(handle.clone())).unwrap();
        assert_eq!(handle.borrow().as_ref().unwrap().get_untracked(), 5);

        // Without a bundle the factory wins.
        rc2.unmount();
        let rc3 = Recomposer::default();
        rc3.mount(persistent_counter(handle.clone())).unwrap();
        assert_eq!(handle.borrow().as_ref().unwrap().get_untracked(), 0);
    }

    #[test]
    fn test_non_primitive_persistence_is_a_configuration_error() {
        // Caught before anything is mounted or rendered.
        let err = retain_persistent::<Vec<i32>>("items", Vec::new).unwrap_err();
        assert!(matches!(err, Error::Configuration { ref key, .. } if key == "items"));

        let rc = Recomposer::default();
        let report = rc
            .mount(|| {
                let _items = retain_persistent("items", Vec::<String>::new)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        match &report.errors[0] {
            Error::Render { path, message, .. } => {
                assert_eq!(path, "root");
                assert!(message.contains("cannot be persisted"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_primitive_persistence_outside_composition_fails() {
        let err = retain_persistent("count", || 0).unwrap_err();
        assert!(matches!(err, Error::OutsideComposition { .. }));
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Filter {
        query: String,
        page: u32,
    }

    #[test]
    fn test_composite_persistence_with_saver() {
        let handle: Rc<RefCell<Option<Cell<Filter>>>> = Rc::new(RefCell::new(None));
        let screen = {
            let handle = handle.clone();
            move || {
                let h = handle.clone();
                child("search", move || {
                    let f = retain_persistent_with("filter", JsonSaver::default(), || Filter {
                        query: String::new(),
                        page: 1,
                    })?;
                    *h.borrow_mut() = Some(f);
                    Ok(())
                })?;
                Ok(())
            }
        };

        let rc = Recomposer::default();
        rc.mount(screen.clone()).unwrap();
        handle.borrow().as_ref().unwrap().set(Filter {
            query: "dune".into(),
            page: 3,
        });
        let bundle = rc.save_state();
        assert!(matches!(bundle.get("root/search#filter"), Some(BundleValue::Str(_))));

        let rc2 = Recomposer::default().with_bundle(rc.unmount().finish());
        rc2.mount(screen).unwrap();
        assert_eq!(
            handle.borrow().as_ref().unwrap().get_untracked(),
            Filter {
                query: "dune".into(),
                page: 3
            }
        );
    }

    #[test]
    fn test_undecodable_bundle_entry_falls_back_to_factory() {
        let mut bundle = Bundle::new();
        bundle.put("root#count", BundleValue::Str("five".into()));
        let handle: Rc<RefCell<Option<Cell<i32>>>> = Rc::new(RefCell::new(None));

        let rc = Recomposer::default().with_bundle(bundle);
        rc.mount(persistent_counter(handle.clone())).unwrap();
        assert_eq!(handle.borrow().as_ref().unwrap().get_untracked(), 0);
    }

    fn movie_detail_fixed(movie_id: String, on_play: Rc<dyn Fn(String)>) {
        let current_id = latest("movie_id", movie_id);
        let current_on_play = latest("on_play", on_play);
        launched_effect("trailer", (), move || async move {
            delay(Duration::from_secs(3)).await;
            (current_on_play.current())(current_id.current());
            Ok(())
        });
    }

    fn movie_detail_stale(movie_id: String, on_play: Rc<dyn Fn(String)>) {
        launched_effect("trailer", (), move || async move {
            delay(Duration::from_secs(3)).await;
            on_play(movie_id);
            Ok(())
        });
    }

    fn movie_detail_keyed(movie_id: String, on_play: Rc<dyn Fn(String)>) {
        launched_effect("trailer", movie_id.clone(), move || async move {
            delay(Duration::from_secs(3)).await;
            on_play(movie_id);
            Ok(())
        });
    }

    struct MovieHost {
        clock: TestClock,
        rc: Recomposer,
        movie: Cell<String>,
        played: Rc<RefCell<Vec<String>>>,
    }

    fn movie_host(detail: fn(String, Rc<dyn Fn(String)>)) -> MovieHost {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        let movie = cell("A".to_string());
        let played = Rc::new(RefCell::new(Vec::new()));

        rc.mount({
            let (movie, played) = (movie.clone(), played.clone());
            move || {
                let id = movie.get();
                let played = played.clone();
                let on_play: Rc<dyn Fn(String)> = Rc::new(move |m: String| played.borrow_mut().push(m));
                child("detail", move || {
                    detail(id.clone(), on_play.clone());
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        MovieHost {
            clock,
            rc,
            movie,
            played,
        }
    }

    #[test]
    fn test_latest_holder_sees_value_changed_during_wait() {
        let h = movie_host(movie_detail_fixed);

        h.clock.advance(Duration::from_secs(1));
        h.rc.tick();
        h.movie.set("B".into());
        assert_eq!(h.rc.tick().recomposed, 2);
        assert!(h.played.borrow().is_empty());

        h.clock.advance(Duration::from_secs(2));
        let report = h.rc.tick();
        assert!(report.is_clean());
        assert_eq!(*h.played.borrow(), vec!["B".to_string()]);
        assert_eq!(h.rc.active_tasks(), 0);
    }

    #[test]
    fn test_captured_parameter_goes_stale() {
        let h = movie_host(movie_detail_stale);

        h.clock.advance(Duration::from_secs(1));
        h.rc.tick();
        h.movie.set("B".into());
        h.rc.tick();

        h.clock.advance(Duration::from_secs(2));
        h.rc.tick();
        assert_eq!(*h.played.borrow(), vec!["A".to_string()]);
    }

    #[test]
    fn test_keyed_effect_restarts_on_key_change() {
        let h = movie_host(movie_detail_keyed);

        h.clock.advance(Duration::from_secs(1));
        h.rc.tick();
        h.movie.set("B".into());
        h.rc.tick();
        assert_eq!(h.rc.active_tasks(), 1);

        // The "A" task was cancelled; the "B" one started a second later.
        h.clock.advance(Duration::from_secs(2));
        h.rc.tick();
        assert!(h.played.borrow().is_empty());

        h.clock.advance(Duration::from_secs(1));
        h.rc.tick();
        assert_eq!(*h.played.borrow(), vec!["B".to_string()]);
    }

    #[test]
    fn test_cancelled_task_never_passes_its_suspension_point() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        let show = cell(true);

        rc.mount({
            let show = show.clone();
            move || {
                if show.get() {
                    child("worker", || Ok(()))?;
                }
                Ok(())
            }
        })
        .unwrap();
        let worker = rc.child_of(rc.root().unwrap(), "worker").unwrap();
        assert_eq!(rc.parent_of(worker), rc.root());
        assert_eq!(rc.node_path(worker).as_deref(), Some("root/worker"));

        let started = counter();
        let reached = counter();
        let handle = rc
            .launch_scoped(worker, {
                let (started, reached) = (started.clone(), reached.clone());
                async move {
                    bump(&started);
                    delay(Duration::from_secs(3)).await;
                    bump(&reached);
                    Ok(())
                }
            })
            .unwrap();
        rc.tick();
        assert_eq!(started.get(), 1);
        assert!(handle.is_active());

        show.set(false);
        let report = rc.tick();
        assert!(report.is_clean());
        assert!(!rc.contains(worker));
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(rc.next_deadline().is_none());

        clock.advance(Duration::from_secs(5));
        let report = rc.tick();
        assert!(report.is_clean());
        assert_eq!(report.timers_fired, 0);
        assert_eq!(reached.get(), 0);
        assert_eq!(rc.active_tasks(), 0);

        assert!(matches!(
            rc.launch_scoped(worker, async { Ok(()) }),
            Err(Error::NodeRemoved(_))
        ));
    }

    #[test]
    fn test_cancel_before_first_poll() {
        let rc = Recomposer::default();
        rc.mount(|| Ok(())).unwrap();
        let started = counter();
        let handle = rc
            .launch_scoped(rc.root().unwrap(), {
                let started = started.clone();
                async move {
                    bump(&started);
                    Ok(())
                }
            })
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        let report = rc.tick();
        assert!(report.is_clean());
        assert_eq!(report.tasks_polled, 0);
        assert_eq!(started.get(), 0);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_task_scope_delayed_increment() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        let shown = Rc::new(RefCell::new(Vec::new()));
        let click: Rc<RefCell<Option<Rc<dyn Fn()>>>> = Rc::new(RefCell::new(None));

        rc.mount({
            let (shown, click) = (shown.clone(), click.clone());
            move || {
                let counter = retain_persistent("counter", || 0)?;
                let scope = remember_task_scope("scope");
                shown.borrow_mut().push(counter.get());
                *click.borrow_mut() = Some(Rc::new(move || {
                    let counter = counter.clone();
                    let launched = scope.launch(async move {
                        delay(Duration::from_secs(3)).await;
                        counter.update(|c| *c += 1);
                        Ok(())
                    });
                    assert!(launched.is_ok());
                }));
                Ok(())
            }
        })
        .unwrap();

        let on_click = click.borrow().clone().unwrap();
        on_click();
        on_click();
        rc.tick();
        assert_eq!(*shown.borrow(), vec![0]);

        clock.advance(Duration::from_secs(3));
        let report = rc.tick();
        assert_eq!(report.timers_fired, 2);
        assert_eq!(report.recomposed, 1);
        assert_eq!(*shown.borrow(), vec![0, 2]);
    }

    #[test]
    fn test_task_scope_outlives_nothing() {
        let rc = Recomposer::default();
        let show = cell(true);
        let scope: Rc<RefCell<Option<TaskScope>>> = Rc::new(RefCell::new(None));

        rc.mount({
            let (show, scope) = (show.clone(), scope.clone());
            move || {
                if show.get() {
                    let scope = scope.clone();
                    child("panel", move || {
                        *scope.borrow_mut() = Some(remember_task_scope("io"));
                        Ok(())
                    })?;
                }
                Ok(())
            }
        })
        .unwrap();
        let s = scope.borrow().clone().unwrap();
        assert!(s.is_active());

        show.set(false);
        rc.tick();
        assert!(!s.is_active());
        assert!(matches!(s.launch(async { Ok(()) }), Err(Error::NodeRemoved(_))));
    }

    #[test]
    fn test_equality_policies() {
        let rc = Recomposer::default();
        let always = cell(1);
        let skip = cell_with_policy(1, EqualityPolicy::SkipEqual);
        let always_renders = counter();
        let skip_renders = counter();

        rc.mount({
            let (always, skip) = (always.clone(), skip.clone());
            let (ar, sr) = (always_renders.clone(), skip_renders.clone());
            move || {
                let (always, ar) = (always.clone(), ar.clone());
                child("always", move || {
                    let _v = always.get();
                    bump(&ar);
                    Ok(())
                })?;
                let (skip, sr) = (skip.clone(), sr.clone());
                child("skip", move || {
                    let _v = skip.get();
                    bump(&sr);
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        always.set(1);
        skip.set(1);
        rc.tick();
        assert_eq!(always_renders.get(), 2);
        assert_eq!(skip_renders.get(), 1);

        skip.set(2);
        rc.tick();
        assert_eq!(skip_renders.get(), 2);
    }

    #[test]
    fn test_render_error_is_isolated() {
        let rc = Recomposer::default();
        let trigger = cell(0);
        let a_renders = counter();
        let b_renders = counter();

        rc.mount({
            let trigger = trigger.clone();
            let (ar, br) = (a_renders.clone(), b_renders.clone());
            move || {
                let (t, ar) = (trigger.clone(), ar.clone());
                child("a", move || {
                    bump(&ar);
                    if t.get() == 1 {
                        anyhow::bail!("bad value");
                    }
                    Ok(())
                })?;
                let (t, br) = (trigger.clone(), br.clone());
                child("b", move || {
                    let _t = t.get();
                    bump(&br);
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        trigger.set(1);
        let report = rc.tick();
        assert_eq!(report.recomposed, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0],
            Error::Render { path, message, .. } if path == "root/a" && message == "bad value"
        ));
        assert_eq!(b_renders.get(), 2);

        // The failed node still listens to what it read.
        trigger.set(2);
        let report = rc.tick();
        assert!(report.is_clean());
        assert_eq!(a_renders.get(), 3);
        assert_eq!(b_renders.get(), 3);
    }

    #[test]
    fn test_render_panic_becomes_error() {
        let rc = Recomposer::default();
        let after = counter();
        let report = rc
            .mount({
                let after = after.clone();
                move || {
                    child("boom", || panic!("boom"))?;
                    bump(&after);
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(after.get(), 1);
        assert!(report.errors[0].is_render());
        assert!(report.errors[0].to_string().contains("boom"));
    }

    #[test]
    fn test_task_error_does_not_affect_siblings() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        rc.mount(|| Ok(())).unwrap();
        let root = rc.root().unwrap();
        let done = counter();

        let failing = rc
            .launch_scoped(root, async {
                delay(Duration::from_secs(1)).await;
                Err(anyhow::anyhow!("network down"))
            })
            .unwrap();
        let ok = rc
            .launch_scoped(root, {
                let done = done.clone();
                async move {
                    delay(Duration::from_secs(2)).await;
                    bump(&done);
                    Ok(())
                }
            })
            .unwrap();
        rc.tick();

        clock.advance(Duration::from_secs(1));
        let report = rc.tick();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].is_task());
        assert_eq!(failing.state(), TaskState::Failed);
        assert!(ok.is_active());

        clock.advance(Duration::from_secs(1));
        assert!(rc.tick().is_clean());
        assert_eq!(ok.state(), TaskState::Completed);
        assert_eq!(done.get(), 1);
    }

    #[test]
    fn test_side_effects_run_after_successful_render_only() {
        let rc = Recomposer::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let count = cell(0);
        let fail = cell(false);

        rc.mount({
            let (log, count, fail) = (log.clone(), count.clone(), fail.clone());
            move || {
                let v = count.get();
                let log = log.clone();
                side_effect(move || log.borrow_mut().push(format!("Counter value = {v}")));
                if fail.get() {
                    anyhow::bail!("render failed");
                }
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(*log.borrow(), vec!["Counter value = 0"]);

        count.set(1);
        assert_eq!(rc.tick().side_effects, 1);
        fail.set(true);
        let report = rc.tick();
        assert_eq!(report.side_effects, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_disposable_effect_cleanup_on_removal() {
        let rc = Recomposer::default();
        let events = Rc::new(RefCell::new(Vec::new()));
        let show = cell(true);
        let dep = cell(1);

        rc.mount({
            let (events, show, dep) = (events.clone(), show.clone(), dep.clone());
            move || {
                if show.get() {
                    let (events, dep) = (events.clone(), dep.clone());
                    child("listener", move || {
                        let d = dep.get();
                        let ev = events.clone();
                        disposable_effect("subscription", d, move || {
                            ev.borrow_mut().push(format!("start {d}"));
                            on_unmount(move || ev.borrow_mut().push(format!("stop {d}")))
                        });
                        Ok(())
                    })?;
                }
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(*events.borrow(), vec!["start 1"]);

        dep.set(2);
        rc.tick();
        assert_eq!(*events.borrow(), vec!["start 1", "stop 1", "start 2"]);

        show.set(false);
        rc.tick();
        assert_eq!(
            *events.borrow(),
            vec!["start 1", "stop 1", "start 2", "stop 2"]
        );
    }

    struct CounterViewModel {
        counter: Cell<i32>,
        cleared: Counter,
    }

    impl CounterViewModel {
        fn increment(&self) {
            self.counter.update(|c| *c += 1);
        }
    }

    impl ViewModel for CounterViewModel {
        fn on_cleared(&self) {
            bump(&self.cleared);
        }
    }

    type Handles = Rc<RefCell<Option<(Rc<CounterViewModel>, Cell<i32>)>>>;

    fn counter_screen(
        shown: Rc<RefCell<Vec<String>>>,
        cleared: Counter,
        handles: Handles,
    ) -> impl Fn() -> anyhow::Result<()> + 'static {
        move || {
            let vm = view_model("counter", || CounterViewModel {
                counter: cell(0),
                cleared: cleared.clone(),
            });
            let plain = retain("plain", || 0);
            shown
                .borrow_mut()
                .push(format!("{}/{}", vm.counter.get(), plain.get()));
            *handles.borrow_mut() = Some((vm, plain));
            Ok(())
        }
    }

    #[test]
    fn test_view_model_survives_configuration_change_only() {
        let shown = Rc::new(RefCell::new(Vec::new()));
        let cleared = counter();
        let handles: Handles = Rc::new(RefCell::new(None));
        let screen = || counter_screen(shown.clone(), cleared.clone(), handles.clone());

        let rc = Recomposer::default();
        rc.mount(screen()).unwrap();
        {
            let (vm, plain) = handles.borrow().clone().unwrap();
            vm.increment();
            vm.increment();
            plain.set(3);
        }
        rc.tick();
        assert_eq!(shown.borrow().last().unwrap(), "2/3");

        // Configuration change: the view model comes along, retained state does not.
        let rc = Recomposer::restore(RuntimeConfig::default(), rc.unmount());
        rc.mount(screen()).unwrap();
        assert_eq!(shown.borrow().last().unwrap(), "2/0");
        assert_eq!(cleared.get(), 0);

        // Process death: the store is cleared and not carried over.
        let bundle = rc.unmount().finish();
        assert_eq!(cleared.get(), 1);
        let rc = Recomposer::default().with_bundle(bundle);
        rc.mount(screen()).unwrap();
        assert_eq!(shown.borrow().last().unwrap(), "0/0");
    }

    #[test]
    fn test_run_until_idle_detects_self_invalidating_node() {
        let rc = Recomposer::new(RuntimeConfig::default().with_max_ticks_until_idle(5));
        let c = cell(0);
        let renders = counter();
        rc.mount({
            let (c, renders) = (c.clone(), renders.clone());
            move || {
                bump(&renders);
                let v = c.get();
                c.set(v + 1);
                // A write is visible to the next read in the same closure.
                assert_eq!(c.get(), v + 1);
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(rc.tick().recomposed, 1);
        assert!(matches!(rc.run_until_idle(), Err(Error::NotIdle { ticks: 5 })));
        assert_eq!(renders.get(), 7);
    }

    #[test]
    fn test_run_until_idle_settles() {
        let rc = Recomposer::default();
        let c = cell(0);
        rc.mount({
            let c = c.clone();
            move || {
                let v = c.get();
                if v < 3 {
                    c.set(v + 1);
                }
                Ok(())
            }
        })
        .unwrap();
        let report = rc.run_until_idle().unwrap();
        assert_eq!(report.recomposed, 3);
        assert_eq!(c.get_untracked(), 3);
    }

    #[test]
    fn test_schedule_recompute_and_mount_twice() {
        let rc = Recomposer::default();
        let renders = counter();
        rc.mount({
            let renders = renders.clone();
            move || {
                bump(&renders);
                Ok(())
            }
        })
        .unwrap();
        assert!(matches!(rc.mount(|| Ok(())), Err(Error::AlreadyMounted)));

        let root = rc.root().unwrap();
        rc.schedule_recompute(root).unwrap();
        rc.schedule_recompute(root).unwrap();
        assert!(rc.is_scheduled(root));
        assert_eq!(rc.tick().recomposed, 1);
        assert_eq!(renders.get(), 2);
    }

    #[test]
    fn test_parent_and_child_dirty_in_same_tick_render_once_each() {
        let rc = Recomposer::default();
        let outer = cell(0);
        let inner = cell(0);
        let child_renders = counter();

        rc.mount({
            let (outer, inner, cr) = (outer.clone(), inner.clone(), child_renders.clone());
            move || {
                let _o = outer.get();
                let (inner, cr) = (inner.clone(), cr.clone());
                child("leaf", move || {
                    let _i = inner.get();
                    bump(&cr);
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        inner.set(1);
        outer.set(1);
        let report = rc.tick();
        assert_eq!(report.recomposed, 2);
        assert_eq!(child_renders.get(), 2);
    }

    #[test]
    fn test_unmount_saves_nested_paths_and_cancels_tasks() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        rc.mount(|| {
            child("list", || {
                for i in 0..2 {
                    child(format!("row{i}"), move || {
                        let c = retain_persistent("checked", || i == 1)?;
                        launched_effect("poll", (), || async {
                            delay(Duration::from_secs(60)).await;
                            Ok(())
                        });
                        let _v = c.get();
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        assert_eq!(rc.node_count(), 4);
        assert_eq!(rc.active_tasks(), 2);

        let teardown = rc.unmount();
        assert_eq!(rc.node_count(), 0);
        assert_eq!(rc.active_tasks(), 0);
        assert!(!rc.is_mounted());
        let keys: Vec<&str> = teardown.bundle.keys().collect();
        assert_eq!(keys, vec!["root/list/row0#checked", "root/list/row1#checked"]);
        assert_eq!(
            teardown.bundle.get("root/list/row1#checked"),
            Some(&BundleValue::Bool(true))
        );
    }

    #[test]
    fn test_yielding_task_is_bounded_per_tick() {
        let rc = Recomposer::new(RuntimeConfig::default().with_max_task_polls_per_tick(4));
        rc.mount(|| Ok(())).unwrap();
        let spins = counter();
        rc.launch_scoped(rc.root().unwrap(), {
            let spins = spins.clone();
            async move {
                for _ in 0..100 {
                    bump(&spins);
                    yield_now().await;
                }
                Ok(())
            }
        })
        .unwrap();
        let report = rc.tick();
        assert_eq!(report.tasks_polled, 4);
        assert!(!rc.is_idle());
    }

    #[test]
    fn test_call_site_keyed_macros() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        let label = cell("first".to_string());
        let seen = Rc::new(RefCell::new(Vec::new()));

        rc.mount({
            let (label, seen) = (label.clone(), seen.clone());
            move || {
                let current = crate::latest!(label.get());
                let seen = seen.clone();
                crate::launched_effect!((), move || async move {
                    delay(Duration::from_secs(1)).await;
                    seen.borrow_mut().push(current.current());
                    Ok(())
                });
                Ok(())
            }
        })
        .unwrap();

        label.set("second".into());
        rc.tick();
        assert_eq!(rc.active_tasks(), 1);
        clock.advance(Duration::from_secs(1));
        rc.tick();
        assert_eq!(*seen.borrow(), vec!["second".to_string()]);
    }

    #[test]
    fn test_second_recomposer_on_same_thread_is_refused() {
        let a = cell(0);
        let b = cell(0);
        let first_renders = counter();
        let second_renders = counter();

        let first = Recomposer::default();
        first
            .mount({
                let (a, r) = (a.clone(), first_renders.clone());
                move || {
                    let _a = a.get();
                    bump(&r);
                    Ok(())
                }
            })
            .unwrap();

        let second = Recomposer::default();
        let root = {
            let (b, r) = (b.clone(), second_renders.clone());
            move || {
                let _b = b.get();
                bump(&r);
                Ok(())
            }
        };
        assert!(matches!(second.mount(root.clone()), Err(Error::ThreadOccupied)));
        assert!(!second.is_mounted());
        assert_eq!(second_renders.get(), 0);

        b.set(1);
        assert_eq!(first.tick().recomposed, 0);
        assert_eq!(first_renders.get(), 1);

        first.unmount();
        second.mount(root).unwrap();
        b.set(2);
        assert_eq!(second.tick().recomposed, 1);
        assert_eq!(second_renders.get(), 2);

        // Dropping a mounted recomposer frees the thread as well.
        drop(second);
        let third = Recomposer::default();
        third.mount(|| Ok(())).unwrap();
    }

    #[test]
    fn test_non_finite_float_slot_keeps_bundle_loadable() {
        let handles: Rc<RefCell<Option<(Cell<f64>, Cell<i32>)>>> = Rc::new(RefCell::new(None));
        let screen = {
            let handles = handles.clone();
            move || {
                let ratio = retain_persistent("ratio", || 0.5f64)?;
                let count = retain_persistent("count", || 0)?;
                *handles.borrow_mut() = Some((ratio, count));
                Ok(())
            }
        };

        let rc = Recomposer::default();
        rc.mount(screen.clone()).unwrap();
        {
            let (ratio, count) = handles.borrow().clone().unwrap();
            ratio.set(f64::INFINITY);
            count.set(5);
        }
        let json = rc.unmount().finish().to_json().unwrap();

        let rc = Recomposer::default().with_bundle(Bundle::from_json(&json).unwrap());
        rc.mount(screen.clone()).unwrap();
        {
            let (ratio, count) = handles.borrow().clone().unwrap();
            assert_eq!(ratio.get_untracked(), f64::INFINITY);
            assert_eq!(count.get_untracked(), 5);
            ratio.set(f64::NAN);
        }
        let json = rc.unmount().finish().to_json().unwrap();

        let rc = Recomposer::default().with_bundle(Bundle::from_json(&json).unwrap());
        rc.mount(screen).unwrap();
        let (ratio, count) = handles.borrow().clone().unwrap();
        assert!(ratio.get_untracked().is_nan());
        assert_eq!(count.get_untracked(), 5);
    }

    #[test]
    fn test_unencodable_value_is_skipped_without_losing_others() {
        let handles: Rc<RefCell<Option<(Cell<u64>, Cell<bool>)>>> = Rc::new(RefCell::new(None));
        let rc = Recomposer::default();
        rc.mount({
            let handles = handles.clone();
            move || {
                let big = retain_persistent("big", || 1u64)?;
                let flag = retain_persistent("flag", || false)?;
                *handles.borrow_mut() = Some((big, flag));
                Ok(())
            }
        })
        .unwrap();
        {
            let (big, flag) = handles.borrow().clone().unwrap();
            big.set(u64::MAX);
            flag.set(true);
        }

        let bundle = rc.save_state();
        assert_eq!(bundle.get("root#big"), None);
        assert_eq!(bundle.get("root#flag"), Some(&BundleValue::Bool(true)));

        handles.borrow().as_ref().unwrap().0.set(7);
        let bundle = rc.unmount().bundle;
        assert_eq!(bundle.get("root#big"), Some(&BundleValue::Int(7)));
    }

    #[test]
    fn test_uncaught_render_panic_leaves_node_renderable() {
        let rc = Recomposer::new(RuntimeConfig::default().with_catch_panics(false));
        let trigger = cell(0);
        let renders = counter();

        rc.mount({
            let (trigger, renders) = (trigger.clone(), renders.clone());
            move || {
                let (t, r) = (trigger.clone(), renders.clone());
                child("fragile", move || {
                    bump(&r);
                    if t.get() == 1 {
                        panic!("fragile render");
                    }
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        trigger.set(1);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rc.tick()));
        assert!(outcome.is_err());
        assert_eq!(renders.get(), 2);
        assert_eq!(current_node(), None);

        trigger.set(2);
        let report = rc.tick();
        assert!(report.is_clean());
        assert_eq!(report.recomposed, 1);
        assert_eq!(renders.get(), 3);
    }

    #[test]
    fn test_task_scope_from_host() {
        let clock = TestClock::new();
        let rc = Recomposer::default().with_clock(clock.clone());
        let show = cell(true);
        rc.mount({
            let show = show.clone();
            move || {
                if show.get() {
                    child("panel", || Ok(()))?;
                }
                Ok(())
            }
        })
        .unwrap();
        let panel = rc.child_of(rc.root().unwrap(), "panel").unwrap();
        let scope = rc.task_scope(panel).unwrap();
        assert_eq!(scope.owner(), panel);

        let done = counter();
        let handle = scope
            .launch({
                let done = done.clone();
                async move {
                    delay(Duration::from_secs(1)).await;
                    bump(&done);
                    Ok(())
                }
            })
            .unwrap();
        rc.tick();
        clock.advance(Duration::from_secs(1));
        rc.tick();
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(done.get(), 1);

        show.set(false);
        rc.tick();
        assert!(!scope.is_active());
        assert!(matches!(rc.task_scope(panel), Err(Error::NodeRemoved(_))));
    }

    #[test]
    fn test_composition_introspection() {
        let rc = Recomposer::default();
        let a = cell(1);
        let seen = Rc::new(RefCell::new(Vec::new()));

        assert_eq!(current_path(), None);
        assert_eq!(reactive::current_observer(), None);

        rc.mount({
            let (a, seen) = (a.clone(), seen.clone());
            move || {
                let (a, seen) = (a.clone(), seen.clone());
                child("detail", move || {
                    let _a = a.get();
                    let observer = reactive::current_observer();
                    let untracked = reactive::untracked(reactive::current_observer);
                    seen.borrow_mut().push((current_path(), observer, current_node(), untracked));
                    Ok(())
                })?;
                Ok(())
            }
        })
        .unwrap();

        let detail = rc.child_of(rc.root().unwrap(), "detail").unwrap();
        let seen = seen.borrow();
        assert_eq!(
            seen[0],
            (Some("root/detail".to_string()), Some(detail), Some(detail), None)
        );
        assert!(reactive::dependencies_of(detail).contains(&a.id()));
        assert!(reactive::dependencies_of(rc.root().unwrap()).is_empty());
    }

    #[test]
    fn test_remember_state_with_key_is_per_node() {
        let rc = Recomposer::default();
        let trigger = cell(0);
        let states: Rc<RefCell<Vec<Rc<RefCell<Vec<i32>>>>>> = Rc::new(RefCell::new(Vec::new()));

        rc.mount({
            let (trigger, states) = (trigger.clone(), states.clone());
            move || {
                let t = trigger.get();
                let history = remember_state_with_key("history", Vec::new);
                history.borrow_mut().push(t);
                states.borrow_mut().push(history);
                Ok(())
            }
        })
        .unwrap();
        trigger.set(1);
        rc.tick();
        trigger.set(2);
        rc.tick();

        let states = states.borrow();
        assert!(Rc::ptr_eq(&states[0], &states[2]));
        assert_eq!(*states[2].borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_persistent_slot_with_closure_saver() {
        let handle: Rc<RefCell<Option<Cell<(u8, u8)>>>> = Rc::new(RefCell::new(None));
        let screen = {
            let handle = handle.clone();
            move || {
                let packed = saver(
                    |v: &(u8, u8)| Some(BundleValue::Int((i64::from(v.0) << 8) | i64::from(v.1))),
                    |saved: &BundleValue| -> Option<(u8, u8)> {
                        match saved {
                            BundleValue::Int(i) => {
                                Some((u8::try_from(i >> 8).ok()?, u8::try_from(i & 0xff).ok()?))
                            }
                            _ => None,
                        }
                    },
                );
                let c = retain_persistent_with("pair", packed, || (0, 0))?;
                *handle.borrow_mut() = Some(c);
                Ok(())
            }
        };

        let rc = Recomposer::default();
        rc.mount(screen.clone()).unwrap();
        handle.borrow().as_ref().unwrap().set((2, 9));
        let bundle = rc.unmount().finish();
        assert_eq!(bundle.get("root#pair"), Some(&BundleValue::Int((2 << 8) | 9)));

        let rc = Recomposer::default().with_bundle(bundle);
        rc.mount(screen).unwrap();
        assert_eq!(handle.borrow().as_ref().unwrap().get_untracked(), (2, 9));
    }
}
