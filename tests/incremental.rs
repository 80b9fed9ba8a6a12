use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use kiln::{
    Blueprint, BuildError, BuildSession, ConflictError, ExecutionError, ExecutionReason,
    KilnError, Outcome, Project, Provider, Settings,
};
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        Self { _dir: dir, root }
    }

    fn path(&self, rel: &str) -> Utf8PathBuf {
        self.root.join(rel)
    }

    fn settings(&self) -> Settings {
        Settings::new().cache_dir(self.path(".kiln")).threads(2)
    }

    fn session(&self) -> BuildSession {
        BuildSession::open(self.settings()).unwrap()
    }
}

/// A copy action reading `in.txt` into `out.txt`, counting its executions.
fn copy_project(ws: &Workspace, runs: &Arc<AtomicUsize>, implementation: &str) -> Project {
    let mut blueprint = Blueprint::new();
    let source = ws.path("in.txt");
    let runs = runs.clone();

    blueprint
        .work(":copy")
        .implementation(implementation)
        .input_path("source", source.clone())
        .output_file("out", ws.path("build/out.txt"))
        .run(move |ctx| {
            runs.fetch_add(1, Ordering::SeqCst);
            fs::copy(&source, ctx.output("out").unwrap())?;
            Ok(())
        });

    blueprint.finish().unwrap()
}

#[test]
fn second_build_is_up_to_date() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let project = copy_project(&ws, &runs, "copy-1");

    let first = project.build(&ws.settings()).unwrap();
    assert_eq!(first.executed(), vec![":copy"]);
    assert!(first.outcome(":copy").unwrap().reason.contains("No history"));

    let second = project.build(&ws.settings()).unwrap();
    assert_eq!(second.skipped(), vec![":copy"]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(ws.path("build/out.txt")).unwrap(), "v1");
}

#[test]
fn changed_input_executes_again() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let project = copy_project(&ws, &runs, "copy-1");

    project.build(&ws.settings()).unwrap();
    fs::write(ws.path("in.txt"), "v2").unwrap();

    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.executed(), vec![":copy"]);
    assert!(report.outcome(":copy").unwrap().reason.contains("'source'"));
    assert_eq!(fs::read_to_string(ws.path("build/out.txt")).unwrap(), "v2");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn modified_output_executes_again() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let project = copy_project(&ws, &runs, "copy-1");

    project.build(&ws.settings()).unwrap();
    fs::write(ws.path("build/out.txt"), "tampered").unwrap();

    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.executed(), vec![":copy"]);
    assert_eq!(fs::read_to_string(ws.path("build/out.txt")).unwrap(), "v1");

    fs::remove_file(ws.path("build/out.txt")).unwrap();
    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.executed(), vec![":copy"]);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn implementation_change_executes_again() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    copy_project(&ws, &runs, "copy-1")
        .build(&ws.settings())
        .unwrap();

    let report = copy_project(&ws, &runs, "copy-2")
        .build(&ws.settings())
        .unwrap();
    assert_eq!(report.executed(), vec![":copy"]);
    assert!(report.outcome(":copy").unwrap().reason.contains("copy-2"));
}

#[test]
fn failed_execution_is_retried() {
    let ws = Workspace::new();
    let fail = Arc::new(AtomicBool::new(true));

    let mut blueprint = Blueprint::new();
    let toggle = fail.clone();
    blueprint
        .work(":flaky")
        .input_value("answer", &Provider::of(42u32))
        .output_file("out", ws.path("build/flaky.txt"))
        .run(move |ctx| {
            fs::write(ctx.output("out").unwrap(), "partial")?;
            if toggle.load(Ordering::SeqCst) {
                anyhow::bail!("flaked");
            }
            Ok(())
        });
    let project = blueprint.finish().unwrap();

    let err = project.build(&ws.settings()).unwrap_err();
    assert!(matches!(err, KilnError::Build(BuildError::Failed(ref f)) if f[0].identity == ":flaky"));

    // Partial outputs of a failed attempt are still owned by the build.
    let session = ws.session();
    assert!(session.outputs().is_generated_by_build(&ws.path("build/flaky.txt")));
    let record = session.history().get(":flaky").unwrap();
    assert!(!record.successful);
    drop(session);

    fail.store(false, Ordering::SeqCst);
    let mut session = ws.session();
    let report = session.run(&project).unwrap();
    let outcome = report.outcome(":flaky").unwrap();
    assert_eq!(outcome.outcome, Outcome::Executed);
    assert_eq!(
        outcome.reason,
        ExecutionReason::PreviousExecutionFailed.to_string()
    );
}

#[test]
fn failure_skips_dependents() {
    let ws = Workspace::new();
    let mut blueprint = Blueprint::new();

    let broken = blueprint
        .work(":broken")
        .output_file("out", ws.path("build/broken.txt"))
        .run(|_| anyhow::bail!("nope"));
    blueprint
        .work(":consumer")
        .input_file("data", &broken.output("out").unwrap())
        .output_file("out", ws.path("build/consumer.txt"))
        .run(|_| Ok(()));
    blueprint.work(":independent").run(|_| Ok(()));

    let project = blueprint.finish().unwrap();
    let mut session = ws.session();
    let report = session.run(&project).unwrap();

    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.not_run, vec![Arc::<str>::from(":consumer")]);
    assert_eq!(report.executed(), vec![":independent"]);
    assert!(!report.is_success());
}

#[test]
fn outputs_feed_downstream_in_order() {
    let ws = Workspace::new();
    let mut blueprint = Blueprint::new();

    // Declared consumer first, the producer is found through the output.
    let generated = Provider::produced_by(":generate", ws.path("build/gen.txt"));
    blueprint
        .work(":render")
        .input_file("generated", &generated)
        .output_file("out", ws.path("build/render.txt"))
        .run(|ctx| {
            let out = ctx.output("out").unwrap();
            let text = fs::read_to_string(out.with_file_name("gen.txt"))?;
            fs::write(out, text.to_uppercase())?;
            Ok(())
        });
    blueprint
        .work(":generate")
        .output_file("out", ws.path("build/gen.txt"))
        .run(|ctx| {
            fs::write(ctx.output("out").unwrap(), "hello")?;
            Ok(())
        });

    let project = blueprint.finish().unwrap();
    assert_eq!(project.dependencies_of(":render"), vec![":generate"]);

    let report = project.build(&Settings::new().cache_dir(ws.path(".kiln")).threads(1)).unwrap();
    assert_eq!(report.executed(), vec![":generate", ":render"]);
    assert_eq!(fs::read_to_string(ws.path("build/render.txt")).unwrap(), "HELLO");
}

#[test]
fn stale_directory_outputs_are_cleaned() {
    let ws = Workspace::new();
    let name = Arc::new(parking_lot::Mutex::new("a.txt"));

    let mut blueprint = Blueprint::new();
    let file = name.clone();
    let selected = Provider::from_fn({
        let name = name.clone();
        move || Ok(Some(name.lock().to_string()))
    });
    blueprint
        .work(":emit")
        .input_value("name", &selected)
        .output_dir("dir", ws.path("build/emit"))
        .run(move |ctx| {
            fs::write(ctx.output("dir").unwrap().join(*file.lock()), "x")?;
            Ok(())
        });
    let project = blueprint.finish().unwrap();

    project.build(&ws.settings()).unwrap();
    assert!(ws.path("build/emit/a.txt").exists());

    *name.lock() = "b.txt";
    project.build(&ws.settings()).unwrap();
    assert!(!ws.path("build/emit/a.txt").exists());
    assert!(ws.path("build/emit/b.txt").exists());
}

#[test]
fn unowned_files_are_never_deleted() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.path("build/emit")).unwrap();
    fs::write(ws.path("build/emit/keep.txt"), "mine").unwrap();

    let mut blueprint = Blueprint::new();
    blueprint
        .work(":emit")
        .output_dir("dir", ws.path("build/emit"))
        .run(|ctx| {
            fs::write(ctx.output("dir").unwrap().join("gen.txt"), "x")?;
            Ok(())
        });

    blueprint.finish().unwrap().build(&ws.settings()).unwrap();
    assert_eq!(fs::read_to_string(ws.path("build/emit/keep.txt")).unwrap(), "mine");
}

#[test]
fn foreign_change_to_unregistered_output_conflicts() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let project = copy_project(&ws, &runs, "copy-1");

    project.build(&ws.settings()).unwrap();

    // Lose the ownership registry, then have someone else rewrite the output.
    fs::remove_file(ws.path(".kiln/outputs.bin")).unwrap();
    fs::write(ws.path("build/out.txt"), "not ours").unwrap();

    let mut session = ws.session();
    let report = session.run(&project).unwrap();
    let failure = &report.failures()[0];
    assert!(matches!(
        &*failure.error,
        ExecutionError::Conflict(ConflictError::ForeignOutput { identity, .. }) if identity == ":copy"
    ));
    assert_eq!(fs::read_to_string(ws.path("build/out.txt")).unwrap(), "not ours");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn corrupt_history_starts_over() {
    let ws = Workspace::new();
    fs::write(ws.path("in.txt"), "v1").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let project = copy_project(&ws, &runs, "copy-1");

    project.build(&ws.settings()).unwrap();
    fs::write(ws.path(".kiln/history.bin"), b"\xff\x00garbage").unwrap();

    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.executed(), vec![":copy"]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.skipped(), vec![":copy"]);
}

#[test]
fn side_effects_run_once() {
    let ws = Workspace::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let version = Provider::of("1.0".to_string()).with_side_effect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut blueprint = Blueprint::new();
    blueprint
        .work(":a")
        .input_value("version", &version.map(|v| format!("a-{v}")))
        .run(|_| Ok(()));
    blueprint
        .work(":b")
        .input_value("version", &version)
        .run(|_| Ok(()));

    let project = blueprint.finish().unwrap();
    project.build(&ws.settings()).unwrap();
    project.build(&ws.settings()).unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn untracked_inputs_always_execute() {
    let ws = Workspace::new();
    let mut blueprint = Blueprint::new();
    blueprint
        .work(":stamp")
        .input_value("now", &Provider::untracked(|| Ok(Some(7u64))))
        .run(|_| Ok(()));
    let project = blueprint.finish().unwrap();

    project.build(&ws.settings()).unwrap();
    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.executed(), vec![":stamp"]);
    assert!(report.outcome(":stamp").unwrap().reason.contains("'now'"));
}

#[test]
fn concurrent_session_is_refused() {
    let ws = Workspace::new();
    let _held = ws.session();

    let mut blueprint = Blueprint::new();
    blueprint.work(":noop").run(|_| Ok(()));
    let err = blueprint
        .finish()
        .unwrap()
        .build(&ws.settings())
        .unwrap_err();

    assert!(matches!(err, KilnError::Store(kiln::StoreError::Locked(_))));
}

#[test]
fn panicking_provider_fails_the_item() {
    let ws = Workspace::new();
    let mut blueprint = Blueprint::new();

    let broken = blueprint
        .work(":broken")
        .input_value("v", &Provider::of(1u32).map(|_| -> u32 { panic!("provider boom") }))
        .output_file("out", ws.path("build/broken.txt"))
        .run(|_| Ok(()));
    blueprint
        .work(":after")
        .input_file("data", &broken.output("out").unwrap())
        .run(|_| Ok(()));
    blueprint.work(":independent").run(|_| Ok(()));
    let project = blueprint.finish().unwrap();

    let mut session = ws.session();
    let report = session.run(&project).unwrap();

    let outcome = report.outcome(":broken").unwrap();
    assert_eq!(outcome.outcome, Outcome::Failed);
    assert!(
        outcome
            .failure
            .as_ref()
            .unwrap()
            .to_string()
            .contains("provider boom")
    );
    assert_eq!(report.not_run, vec![Arc::<str>::from(":after")]);
    assert_eq!(report.executed(), vec![":independent"]);
}

#[test]
fn cancelling_mid_build_keeps_finished_work() {
    let ws = Workspace::new();
    let mut session = ws.session();
    let cancel = session.cancellation();

    let mut blueprint = Blueprint::new();
    let first = blueprint
        .work(":first")
        .output_file("out", ws.path("build/first.txt"))
        .run(move |ctx| {
            fs::write(ctx.output("out").unwrap(), "done")?;
            cancel.cancel();
            Ok(())
        });
    blueprint
        .work(":second")
        .input_file("first", &first.output("out").unwrap())
        .output_file("out", ws.path("build/second.txt"))
        .run(|_| Ok(()));
    let project = blueprint.finish().unwrap();

    let report = session.run(&project).unwrap();
    assert_eq!(report.outcome(":first").unwrap().outcome, Outcome::Executed);
    assert_eq!(report.not_run, vec![Arc::<str>::from(":second")]);
    assert!(session.history().get(":first").unwrap().successful);
    assert!(session.history().get(":second").is_none());
    assert!(!session.history().is_dirty());
    drop(session);

    // The record made it to disk, the next build picks up where this one stopped.
    let report = project.build(&ws.settings()).unwrap();
    assert_eq!(report.skipped(), vec![":first"]);
    assert_eq!(report.executed(), vec![":second"]);
}
