//! Seven ways to keep a counter, driven against a text "screen".
//!
//! Each variant is clicked three times, then survives (or not) a
//! configuration change and a process death. Run with `RUST_LOG=debug` to
//! watch the recomposer work.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use reprise_core::prelude::*;
use serde::{Deserialize, Serialize};

/// What the user sees, plus the handler of the single button.
#[derive(Clone, Default)]
struct Screen {
    text: Rc<RefCell<String>>,
    on_click: Rc<RefCell<Option<Rc<dyn Fn()>>>>,
}

impl Screen {
    fn show(&self, text: impl Into<String>, on_click: impl Fn() + 'static) {
        *self.text.borrow_mut() = text.into();
        *self.on_click.borrow_mut() = Some(Rc::new(on_click));
    }

    fn text(&self) -> String {
        self.text.borrow().clone()
    }

    fn click(&self) -> anyhow::Result<()> {
        let handler = self
            .on_click
            .borrow()
            .clone()
            .context("nothing on screen to click")?;
        handler();
        Ok(())
    }
}

type App = Box<dyn Fn() -> anyhow::Result<()>>;

fn plain_variable(screen: Screen) -> App {
    Box::new(move || {
        let counter = Rc::new(std::cell::Cell::new(0));
        let c = counter.clone();
        screen.show(format!("Count: {}", counter.get()), move || c.set(c.get() + 1));
        Ok(())
    })
}

fn unretained_cell(screen: Screen) -> App {
    Box::new(move || {
        let counter = cell(0);
        let c = counter.clone();
        screen.show(format!("Count: {}", counter.get()), move || c.update(|v| *v += 1));
        Ok(())
    })
}

fn retained_cell(screen: Screen) -> App {
    Box::new(move || {
        let counter = retain("counter", || 0);
        let c = counter.clone();
        screen.show(format!("Count: {}", counter.get()), move || c.update(|v| *v += 1));
        Ok(())
    })
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Stepper {
    value: i64,
    step: i64,
}

fn persistent_cell(screen: Screen) -> App {
    Box::new(move || {
        let counter = retain_persistent("counter", || 0)?;
        // Composite state needs an explicit saver.
        let stepper =
            retain_persistent_with("stepper", JsonSaver::default(), || Stepper { value: 0, step: 10 })?;
        let (c, s) = (counter.clone(), stepper.clone());
        screen.show(
            format!("Count: {} (stepped: {})", counter.get(), stepper.get().value),
            move || {
                c.update(|v| *v += 1);
                s.update(|st| st.value += st.step);
            },
        );
        Ok(())
    })
}

struct CounterViewModel {
    counter: Cell<i32>,
}

impl CounterViewModel {
    fn increment(&self) {
        self.counter.update(|c| *c += 1);
    }
}

impl ViewModel for CounterViewModel {
    fn on_cleared(&self) {
        log::info!("CounterViewModel cleared at {}", self.counter.get_untracked());
    }
}

fn view_model_counter(screen: Screen) -> App {
    Box::new(move || {
        let vm = view_model("counter", || CounterViewModel { counter: cell(0) });
        let text = format!("Count: {}", vm.counter.get());
        screen.show(text, move || vm.increment());
        Ok(())
    })
}

fn delayed_counter(screen: Screen) -> App {
    Box::new(move || {
        let counter = retain_persistent("counter", || 0)?;
        let scope = remember_task_scope("clicks");
        let c = counter.clone();
        screen.show(format!("Count: {}", counter.get()), move || {
            let c = c.clone();
            let launched = scope.launch(async move {
                delay(Duration::from_secs(3)).await;
                c.update(|v| *v += 1);
                Ok(())
            });
            if let Err(e) = launched {
                log::warn!("click ignored: {e}");
            }
        });
        Ok(())
    })
}

fn settle(rc: &Recomposer, report: TickReport) -> anyhow::Result<()> {
    if let Some(e) = report.errors.into_iter().next() {
        return Err(e.into());
    }
    let report = rc.run_until_idle()?;
    match report.errors.into_iter().next() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn lifecycle(name: &str, app: fn(Screen) -> App) -> anyhow::Result<()> {
    log::info!("running `{name}`");
    let clock = TestClock::new();
    let screen = Screen::default();

    let rc = Recomposer::default().with_clock(clock.clone());
    let report = rc.mount(app(screen.clone()))?;
    settle(&rc, report)?;
    for _ in 0..3 {
        screen.click()?;
        let report = rc.tick();
        settle(&rc, report)?;
    }
    clock.advance(Duration::from_secs(3));
    let report = rc.tick();
    settle(&rc, report)?;
    println!("{name:<18} after 3 clicks:    {}", screen.text());

    let rc = Recomposer::restore(RuntimeConfig::default(), rc.unmount()).with_clock(clock.clone());
    let report = rc.mount(app(screen.clone()))?;
    settle(&rc, report)?;
    println!("{name:<18} after rotation:    {}", screen.text());

    let json = rc.unmount().finish().to_json()?;
    log::debug!("saved bundle: {json}");
    let rc = Recomposer::default()
        .with_clock(clock)
        .with_bundle(Bundle::from_json(&json)?);
    let report = rc.mount(app(screen.clone()))?;
    settle(&rc, report)?;
    println!("{name:<18} after recreation:  {}", screen.text());
    rc.unmount();
    Ok(())
}

fn movie_detail(movie_id: String, trailer: Screen, fresh: bool) {
    let play = move |id: String| *trailer.text.borrow_mut() = format!("Playing trailer for {id}");
    if fresh {
        let current_id = latest("movie_id", movie_id);
        launched_effect("trailer", (), move || async move {
            delay(Duration::from_secs(3)).await;
            play(current_id.current());
            Ok(())
        });
    } else {
        launched_effect("trailer", (), move || async move {
            delay(Duration::from_secs(3)).await;
            play(movie_id);
            Ok(())
        });
    }
}

fn trailer_race(fresh: bool) -> anyhow::Result<()> {
    let clock = TestClock::new();
    let rc = Recomposer::default().with_clock(clock.clone());
    let movie = cell("A".to_string());
    let trailer = Screen::default();

    let report = rc.mount({
        let (movie, trailer) = (movie.clone(), trailer.clone());
        move || {
            let id = movie.get();
            let trailer = trailer.clone();
            child("detail", move || {
                movie_detail(id.clone(), trailer.clone(), fresh);
                Ok(())
            })?;
            Ok(())
        }
    })?;
    settle(&rc, report)?;

    clock.advance(Duration::from_secs(1));
    movie.set("B".into());
    let report = rc.tick();
    settle(&rc, report)?;
    clock.advance(Duration::from_secs(2));
    let report = rc.tick();
    settle(&rc, report)?;

    let name = if fresh { "latest holder" } else { "captured id" };
    println!("{name:<18} A then B:          {}", trailer.text());
    rc.unmount();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    lifecycle("plain variable", plain_variable)?;
    lifecycle("unretained cell", unretained_cell)?;
    lifecycle("retained cell", retained_cell)?;
    lifecycle("persistent cell", persistent_cell)?;
    lifecycle("view model", view_model_counter)?;
    lifecycle("delayed clicks", delayed_counter)?;

    trailer_race(false)?;
    trailer_race(true)?;
    Ok(())
}
