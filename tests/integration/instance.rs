mod common;

use common::{test_context, unit_dir, wait_for_state, write_unit};
use minisysd::{command, unit::UnitState};

#[test]
fn starting_an_instance_creates_it_from_the_template() {
    let ctx = test_context();
    write_unit("tmpl-g@.service", "[Service]\nExecStart=/bin/echo %i\n");
    ctx.graph.reload(&ctx.paths);

    let mut out = Vec::new();
    let outcome = command::dispatch(
        ctx,
        &["start".to_string(), "tmpl-g@hello".to_string()],
        &mut out,
    );
    let rendered = String::from_utf8(out).unwrap();
    assert_eq!(outcome.code, 0, "{rendered}");
    assert!(rendered.contains("Start: tmpl-g@hello OK"), "{rendered}");

    // The instance file is a hard link of the template.
    assert!(unit_dir().join("tmpl-g@hello.service").exists());

    let unit = ctx.graph.get("tmpl-g@hello").unwrap();
    wait_for_state(&unit, UnitState::Stopped);

    // %i expanded to the instance parameter on the way into the log.
    common::wait_until("instance log line", || {
        std::fs::read_to_string(ctx.paths.unit_log_file("tmpl-g@hello"))
            .map(|contents| contents.lines().any(|line| line.ends_with(" hello")))
            .unwrap_or(false)
    });
}

#[test]
fn create_and_delete_instance_commands() {
    let ctx = test_context();
    write_unit("inst-h@.service", "[Service]\nExecStart=/bin/echo %i\n");
    ctx.graph.reload(&ctx.paths);

    let mut out = Vec::new();
    let outcome = command::dispatch(
        ctx,
        &["create-instance".to_string(), "inst-h@one".to_string()],
        &mut out,
    );
    assert_eq!(outcome.code, 0);
    assert!(unit_dir().join("inst-h@one.service").exists());
    assert!(ctx.graph.get("inst-h@one").is_some());

    let mut out = Vec::new();
    let outcome = command::dispatch(
        ctx,
        &["delete-instance".to_string(), "inst-h@one".to_string()],
        &mut out,
    );
    assert_eq!(outcome.code, 0);
    assert!(!unit_dir().join("inst-h@one.service").exists());
    assert!(ctx.graph.get("inst-h@one").is_none());
}

#[test]
fn create_instance_rejects_non_templates() {
    let ctx = test_context();
    write_unit("plain-unit.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "plain-unit").unwrap();
    assert!(unit.create_instance("x").is_err());
}

#[test]
fn enable_on_an_instance_creates_it_first() {
    let ctx = test_context();
    write_unit("tmpl-k@.service", "[Service]\nExecStart=/bin/echo %i\n");
    ctx.graph.reload(&ctx.paths);

    let mut out = Vec::new();
    let outcome = command::dispatch(
        ctx,
        &["enable".to_string(), "tmpl-k@web".to_string()],
        &mut out,
    );
    let rendered = String::from_utf8(out).unwrap();
    assert_eq!(outcome.code, 0, "{rendered}");
    assert!(unit_dir().join("tmpl-k@web.service").exists());
    assert!(
        ctx.paths
            .wants_dir()
            .join("tmpl-k@web.service")
            .exists()
    );
}
