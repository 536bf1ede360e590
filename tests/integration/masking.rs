mod common;

use std::{fs, os::unix::fs::symlink};

use common::{test_context, unit_dir, write_unit};
use minisysd::{error::UnitError, unit::UnitState};

#[test]
fn dev_null_symlink_masks_the_unit() {
    let ctx = test_context();
    symlink("/dev/null", unit_dir().join("masked-f.service")).unwrap();
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "masked-f").unwrap();
    assert!(unit.is_masked());
    assert!(matches!(unit.start(ctx), Err(UnitError::Masked)));
    assert!(matches!(unit.stop(ctx), Err(UnitError::Masked)));
    assert!(matches!(unit.restart(ctx), Err(UnitError::Masked)));
    assert!(matches!(unit.reload(ctx), Err(UnitError::Masked)));
    assert_eq!(unit.state(), UnitState::Stopped);
    assert!(unit.status_line().contains("(masked)"));
}

#[test]
fn mask_writes_the_symlink_and_unmask_removes_it() {
    let ctx = test_context();
    // The unit file lives in a lower-priority directory so the admin dir is
    // free for the mask symlink.
    let vendor_dir = ctx.paths.root().join("usr/lib/systemd/system");
    fs::create_dir_all(&vendor_dir).unwrap();
    fs::write(
        vendor_dir.join("maskable.service"),
        "[Service]\nExecStart=/bin/true\n",
    )
    .unwrap();
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "maskable").unwrap();
    unit.mask(ctx).unwrap();
    let link = unit_dir().join("maskable.service");
    assert_eq!(fs::read_link(&link).unwrap().to_str(), Some("/dev/null"));
    assert!(matches!(unit.start(ctx), Err(UnitError::Masked)));

    // Masking again trips over the existing symlink.
    assert!(matches!(unit.mask(ctx), Err(UnitError::MaskExists { .. })));

    unit.unmask(ctx).unwrap();
    assert!(!link.exists());
    assert!(!unit.is_masked());

    ctx.graph.reload(&ctx.paths);
    let unit = ctx.graph.find(&ctx.paths, "maskable").unwrap();
    unit.start(ctx).unwrap();
    common::wait_for_state(&unit, UnitState::Stopped);
}

#[test]
fn unmask_refuses_to_touch_real_files() {
    let ctx = test_context();
    write_unit("solid.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "solid").unwrap();
    unit.unmask(ctx).unwrap();
    assert!(unit_dir().join("solid.service").exists());
}

#[test]
fn enable_and_disable_manage_the_wants_marker() {
    let ctx = test_context();
    write_unit("enableme.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);

    let unit = ctx.graph.find(&ctx.paths, "enableme").unwrap();
    assert!(!unit.is_enabled(ctx));
    unit.enable(ctx).unwrap();
    assert!(unit.is_enabled(ctx));
    assert!(
        ctx.paths
            .wants_dir()
            .join("enableme.service")
            .exists()
    );
    unit.disable(ctx).unwrap();
    assert!(!unit.is_enabled(ctx));
}
