mod common;

use common::{test_context, wait_for_state, write_unit};
use minisysd::{command, error::UnitError, unit::UnitState};

#[test]
fn requires_starts_the_dependency_first() {
    let ctx = test_context();
    write_unit("dep-a.service", "[Service]\nExecStart=/bin/true\n");
    write_unit(
        "dep-b.service",
        "[Unit]\nRequires=dep-a.service\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let b = ctx.graph.find(&ctx.paths, "dep-b").unwrap();
    b.start(ctx).unwrap();

    let a = ctx.graph.get("dep-a").unwrap();
    wait_for_state(&a, UnitState::Stopped);
    wait_for_state(&b, UnitState::Stopped);

    // Starting b performed a's ExecStart, so a's log file was opened.
    assert!(ctx.paths.unit_log_file("dep-a").exists());

    let mut out = Vec::new();
    let outcome = command::dispatch(
        ctx,
        &["status".to_string(), "dep-a".to_string(), "dep-b".to_string()],
        &mut out,
    );
    assert_eq!(outcome.code, 0);
    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.contains("State: Stopped: dep-a"), "{rendered}");
    assert!(rendered.contains("State: Stopped: dep-b"), "{rendered}");
}

#[test]
fn requisite_on_a_stopped_unit_fails_without_starting_it() {
    let ctx = test_context();
    write_unit("req-x.service", "[Service]\nExecStart=/bin/sleep 5\n");
    write_unit(
        "req-c.service",
        "[Unit]\nRequisite=req-x.service\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let c = ctx.graph.find(&ctx.paths, "req-c").unwrap();
    let err = c.start(ctx).unwrap_err();
    assert!(matches!(err, UnitError::Dependency { .. }));
    assert!(err.to_string().contains("req-x.service"), "{err}");
    assert_eq!(c.state(), UnitState::Stopped);
    assert_eq!(ctx.graph.get("req-x").unwrap().state(), UnitState::Stopped);
}

#[test]
fn oneshot_with_explicit_remain_false_lands_in_stopped() {
    let ctx = test_context();
    write_unit(
        "shot-e.service",
        "[Service]\nType=oneshot\nExecStart=/bin/true\nRemainAfterExit=false\n",
    );
    ctx.graph.reload(&ctx.paths);

    let e = ctx.graph.find(&ctx.paths, "shot-e").unwrap();
    e.start(ctx).unwrap();
    wait_for_state(&e, UnitState::Stopped);
    assert!(e.state_error().is_none(), "{:?}", e.state_error());
}

#[test]
fn oneshot_without_explicit_remain_stays_running() {
    let ctx = test_context();
    write_unit(
        "shot-r.service",
        "[Service]\nType=oneshot\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "shot-r").unwrap();
    unit.start(ctx).unwrap();
    // The process exits immediately, but the unit counts as up.
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert_eq!(unit.state(), UnitState::Running);

    unit.stop(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Stopped);
}

#[test]
fn conflicts_stop_the_other_unit() {
    let ctx = test_context();
    write_unit("con-one.service", "[Service]\nExecStart=/bin/sleep 30\n");
    write_unit(
        "con-two.service",
        "[Unit]\nConflicts=con-one.service\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let one = ctx.graph.find(&ctx.paths, "con-one").unwrap();
    one.start(ctx).unwrap();
    assert_eq!(one.state(), UnitState::Running);

    let two = ctx.graph.find(&ctx.paths, "con-two").unwrap();
    two.start(ctx).unwrap();
    wait_for_state(&one, UnitState::Stopped);
}

#[test]
fn condition_failure_is_a_clean_no_start() {
    let ctx = test_context();
    write_unit(
        "cond.service",
        "[Service]\nExecCondition=/bin/false\nExecStart=/bin/sleep 30\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "cond").unwrap();
    unit.start(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Stopped);
    assert!(unit.state_error().is_none());
}

#[test]
fn failing_start_pre_aborts_the_start() {
    let ctx = test_context();
    write_unit(
        "prefail.service",
        "[Service]\nExecStartPre=/bin/sh -c 'exit 9'\nExecStart=/bin/sleep 30\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "prefail").unwrap();
    let err = unit.start(ctx).unwrap_err();
    assert!(matches!(err, UnitError::Exec { code: 9, .. }), "{err}");
    assert_eq!(unit.state(), UnitState::Stopped);
    assert!(unit.state_error().is_some());
}

#[test]
fn tolerated_start_pre_failure_still_starts() {
    let ctx = test_context();
    write_unit(
        "pretol.service",
        "[Service]\nExecStartPre=-/bin/sh -c 'exit 9'\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "pretol").unwrap();
    unit.start(ctx).unwrap();
    wait_for_state(&unit, UnitState::Stopped);
}

#[test]
fn stop_kills_a_long_running_service() {
    let ctx = test_context();
    write_unit(
        "longrun.service",
        "[Service]\nExecStart=/bin/sleep 600\nTimeoutStopSec=2\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "longrun").unwrap();
    unit.start(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Running);
    unit.stop(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Stopped);
    // sleep honours SIGTERM, so the SIGKILL fallback never fires.
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(unit.state(), UnitState::Stopped);
    let error = unit.state_error().unwrap_or_default();
    assert!(!error.contains("SIGKILL"), "{error}");
}

#[test]
fn service_output_is_captured_in_its_log() {
    let ctx = test_context();
    write_unit(
        "echoer.service",
        "[Service]\nExecStart=/bin/echo captured-line\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "echoer").unwrap();
    unit.start(ctx).unwrap();
    wait_for_state(&unit, UnitState::Stopped);
    common::wait_until("echoer log line", || {
        std::fs::read_to_string(ctx.paths.unit_log_file("echoer"))
            .map(|contents| contents.lines().any(|line| line.ends_with(" captured-line")))
            .unwrap_or(false)
    });
}

#[test]
fn environment_reaches_the_child() {
    let ctx = test_context();
    write_unit(
        "envy.service",
        "[Service]\nEnvironment=GREETING=bonjour\nExecStart=/bin/sh -c 'echo $GREETING'\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "envy").unwrap();
    unit.start(ctx).unwrap();
    wait_for_state(&unit, UnitState::Stopped);
    common::wait_until("envy log line", || {
        std::fs::read_to_string(ctx.paths.unit_log_file("envy"))
            .map(|contents| contents.lines().any(|line| line.ends_with(" bonjour")))
            .unwrap_or(false)
    });
}
