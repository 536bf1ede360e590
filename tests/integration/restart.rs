mod common;

use common::{test_context, wait_for_state, write_unit};
use minisysd::unit::UnitState;

#[test]
fn on_failure_restarts_until_stopped() {
    let ctx = test_context();
    write_unit(
        "flappy.service",
        "[Service]\nExecStart=/bin/sh -c 'sleep 0.15; exit 7'\n\
         Restart=on-failure\nRestartSec=100ms\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "flappy").unwrap();
    unit.start(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Running);

    // First failure: the monitor records exit 7 and enters Restarting.
    wait_for_state(&unit, UnitState::Restarting);
    let error = unit.state_error().unwrap_or_default();
    assert!(error.contains("7"), "{error}");

    // The restart sleep elapses and the unit comes back up, then fails and
    // restarts again: at least two Running entries.
    wait_for_state(&unit, UnitState::Running);
    wait_for_state(&unit, UnitState::Restarting);
    wait_for_state(&unit, UnitState::Running);

    unit.stop(ctx).unwrap();
    // A stop observed mid-cycle pins the unit down for good.
    std::thread::sleep(std::time::Duration::from_millis(500));
    assert_eq!(unit.state(), UnitState::Stopped);
}

#[test]
fn clean_exit_with_restart_no_stays_stopped() {
    let ctx = test_context();
    write_unit(
        "oneoff.service",
        "[Service]\nExecStart=/bin/true\nRestart=no\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "oneoff").unwrap();
    unit.start(ctx).unwrap();
    wait_for_state(&unit, UnitState::Stopped);
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(unit.state(), UnitState::Stopped);
}

#[test]
fn always_restarts_clean_exits_too() {
    let ctx = test_context();
    write_unit(
        "comeback.service",
        "[Service]\nExecStart=/bin/sh -c 'sleep 0.15'\nRestart=always\nRestartSec=100ms\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "comeback").unwrap();
    unit.start(ctx).unwrap();
    wait_for_state(&unit, UnitState::Restarting);
    wait_for_state(&unit, UnitState::Running);

    unit.stop(ctx).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(500));
    assert_eq!(unit.state(), UnitState::Stopped);
}

#[test]
fn restart_cycles_through_restarting() {
    let ctx = test_context();
    write_unit(
        "bounce.service",
        "[Service]\nExecStart=/bin/sleep 30\n",
    );
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "bounce").unwrap();
    unit.start(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Running);
    unit.restart(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Running);
    unit.stop(ctx).unwrap();
    assert_eq!(unit.state(), UnitState::Stopped);
}
