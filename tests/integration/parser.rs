mod common;

use std::fs;

use common::{test_context, unit_dir, write_unit};
use minisysd::unit::RelationKind;

#[test]
fn inverse_relations_hold_after_reload() {
    let ctx = test_context();
    write_unit(
        "rel-web.service",
        "[Unit]\nWants=rel-db.service\nRequires=rel-cache.service\n\
         [Service]\nExecStart=/bin/true\n",
    );
    write_unit("rel-db.service", "[Service]\nExecStart=/bin/true\n");
    write_unit(
        "rel-cache.service",
        "[Unit]\nConflicts=rel-db.service\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);

    let db = ctx.graph.get("rel-db").unwrap();
    let cache = ctx.graph.get("rel-cache").unwrap();
    let web_def = ctx.graph.get("rel-web").unwrap().definition().unwrap();

    assert!(web_def.relations.get(RelationKind::Wants).contains("rel-db.service"));
    let db_def = db.definition().unwrap();
    assert!(db_def.relations.get(RelationKind::WantedBy).contains("rel-web"));
    assert!(
        db_def
            .relations
            .get(RelationKind::ConflictedBy)
            .contains("rel-cache")
    );
    let cache_def = cache.definition().unwrap();
    assert!(
        cache_def
            .relations
            .get(RelationKind::RequiredBy)
            .contains("rel-web")
    );
}

#[test]
fn unresolved_relation_targets_are_kept_without_inverse() {
    let ctx = test_context();
    write_unit(
        "rel-orphan.service",
        "[Unit]\nRequires=rel-ghost.service\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);
    let def = ctx.graph.get("rel-orphan").unwrap().definition().unwrap();
    assert!(
        def.relations
            .get(RelationKind::Requires)
            .contains("rel-ghost.service")
    );
    assert!(ctx.graph.get("rel-ghost").is_none());
}

#[test]
fn drop_ins_layer_onto_the_primary_file() {
    let ctx = test_context();
    write_unit(
        "layered.service",
        "[Unit]\nDescription=primary\n[Service]\nExecStart=/bin/true\nEnvironment=A=1\n",
    );
    let dropin_dir = unit_dir().join("layered.service.d");
    fs::create_dir_all(&dropin_dir).unwrap();
    fs::write(
        dropin_dir.join("10-extra.conf"),
        "[Unit]\nDescription=overridden\n[Service]\nEnvironment=B=2\n",
    )
    .unwrap();
    ctx.graph.reload(&ctx.paths);

    let def = ctx.graph.get("layered").unwrap().definition().unwrap();
    assert_eq!(def.description, "overridden");
    assert_eq!(def.environment, vec!["A=1", "B=2"]);
    assert_eq!(def.exec_start, vec!["/bin/true"]);
}

#[test]
fn units_resolve_with_and_without_suffix() {
    let ctx = test_context();
    write_unit("suffixed.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);
    let plain = ctx.graph.find(&ctx.paths, "suffixed").unwrap();
    let suffixed = ctx.graph.find(&ctx.paths, "suffixed.service").unwrap();
    assert_eq!(plain.name(), suffixed.name());
}

#[test]
fn find_reloads_once_for_new_units() {
    let ctx = test_context();
    // Not yet known; the file appears between reloads.
    write_unit("latecomer.service", "[Service]\nExecStart=/bin/true\n");
    let unit = ctx.graph.find(&ctx.paths, "latecomer.service").unwrap();
    assert_eq!(unit.name(), "latecomer");
    assert!(matches!(
        ctx.graph.find(&ctx.paths, "never-existed"),
        Err(minisysd::error::UnitError::NotFound)
    ));
}

#[test]
fn stopped_units_without_files_are_evicted() {
    let ctx = test_context();
    write_unit("fleeting.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);
    assert!(ctx.graph.get("fleeting").is_some());

    fs::remove_file(unit_dir().join("fleeting.service")).unwrap();
    ctx.graph.reload(&ctx.paths);
    assert!(ctx.graph.get("fleeting").is_none());
}

#[test]
fn failed_parse_restores_the_previous_definition() {
    let ctx = test_context();
    write_unit(
        "flaky.service",
        "[Unit]\nDescription=good\n[Service]\nExecStart=/bin/true\n",
    );
    ctx.graph.reload(&ctx.paths);
    assert_eq!(
        ctx.graph.get("flaky").unwrap().definition().unwrap().description,
        "good"
    );

    write_unit(
        "flaky.service",
        "[Service]\nExecStart=/bin/true\nRestartSec=notaduration\n",
    );
    ctx.graph.reload(&ctx.paths);
    let def = ctx.graph.get("flaky").unwrap().definition().unwrap();
    assert_eq!(def.description, "good", "shadow definition not restored");
}

#[test]
fn list_is_lexicographic() {
    let ctx = test_context();
    write_unit("zz-last.service", "[Service]\nExecStart=/bin/true\n");
    write_unit("aa-first.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);
    let names = ctx.graph.list();
    let aa = names.iter().position(|n| n == "aa-first").unwrap();
    let zz = names.iter().position(|n| n == "zz-last").unwrap();
    assert!(aa < zz);
}
