mod common;

use std::{
    io::Write,
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread,
};

use common::{test_context, write_unit};
use minisysd::{control, supervisor};

/// Serves `count` connections on the context's control socket, exactly as the
/// supervisor's accept loop does.
fn serve_connections(count: usize) -> thread::JoinHandle<()> {
    let ctx = Arc::clone(test_context());
    let socket_path = ctx.paths.control_socket();
    std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).unwrap();
    thread::spawn(move || {
        for _ in 0..count {
            let (stream, _) = listener.accept().unwrap();
            supervisor::handle_connection(Arc::clone(&ctx), stream);
        }
    })
}

fn roundtrip(args: &[&str]) -> (u16, String) {
    let ctx = test_context();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let mut out = Vec::new();
    let code = control::send_command(&ctx.paths, &args, &mut out).unwrap();
    (code, String::from_utf8_lossy(&out).into_owned())
}

#[test]
fn list_status_and_errors_over_the_socket() {
    let ctx = test_context();
    write_unit("wired.service", "[Service]\nExecStart=/bin/true\n");
    ctx.graph.reload(&ctx.paths);

    let server = serve_connections(4);

    let (code, output) = roundtrip(&["list"]);
    assert_eq!(code, 0);
    assert!(output.lines().any(|line| line == "wired"), "{output}");

    let (code, output) = roundtrip(&["status", "wired"]);
    assert_eq!(code, 0);
    assert!(output.contains("State: Stopped: wired"), "{output}");

    // Unknown units are reported failures.
    let (code, output) = roundtrip(&["stop", "no-such-unit"]);
    assert_eq!(code, 1);
    assert!(output.contains("no-such-unit"), "{output}");

    // Unknown subcommands are soft errors: help text, exit code 0.
    let (code, output) = roundtrip(&["frobnicate"]);
    assert_eq!(code, 0);
    assert!(!output.is_empty());

    server.join().unwrap();
}

#[test]
fn malformed_frames_do_not_crash_the_server() {
    let ctx = test_context();
    let socket_path = ctx.paths.root().join("tmp/malformed-test.sock");
    std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
    let listener = UnixListener::bind(&socket_path).unwrap();
    let ctx_clone = Arc::clone(ctx);
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // Must return cleanly on a garbage frame.
        supervisor::handle_connection(ctx_clone, stream);
    });

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    // Announce 40 arguments, deliver half of one, hang up.
    stream.write_all(&40u16.to_le_bytes()).unwrap();
    stream.write_all(&10u16.to_le_bytes()).unwrap();
    stream.write_all(b"abc").unwrap();
    drop(stream);

    server.join().unwrap();
}

#[test]
fn show_renders_the_definition() {
    let ctx = test_context();
    write_unit(
        "showme.service",
        "[Unit]\nDescription=Visible in show\n[Service]\nExecStart=/bin/true\nRestart=on-failure\n",
    );
    ctx.graph.reload(&ctx.paths);

    let mut out = Vec::new();
    let outcome = minisysd::command::dispatch(
        ctx,
        &["show".to_string(), "showme".to_string()],
        &mut out,
    );
    assert_eq!(outcome.code, 0);
    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.contains("=== showme ==="), "{rendered}");
    assert!(rendered.contains("Visible in show"), "{rendered}");
    assert!(rendered.contains("on-failure"), "{rendered}");
    assert!(rendered.contains("Masked: false"), "{rendered}");
}

#[test]
fn daemon_reload_reports_ok() {
    let ctx = test_context();
    let mut out = Vec::new();
    let outcome = minisysd::command::dispatch(ctx, &["daemon-reload".to_string()], &mut out);
    assert_eq!(outcome.code, 0);
    assert!(String::from_utf8(out).unwrap().ends_with("OK\n"));
}

#[test]
fn poweroff_flags_the_outcome() {
    let ctx = test_context();
    let mut out = Vec::new();
    let outcome = minisysd::command::dispatch(ctx, &["poweroff".to_string()], &mut out);
    assert_eq!(outcome.code, 0);
    assert!(outcome.poweroff);
    assert!(String::from_utf8(out).unwrap().contains("Shutting down"));
}
