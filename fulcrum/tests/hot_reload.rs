
use std::fs;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, SystemTime};

use fulcrum::config::Config;
use harness::{body_of, read_response, send_request, status_line, HttpOrigin, ProxyHandle};

fn write_config_file(path: &std::path::Path, port: u16, backend: std::net::SocketAddr) {
    let json = format!(
        r#"{{
            "listen_port": {port},
            "bind_address": "127.0.0.1",
            "algorithm": "round_robin",
            "backends": [{{"host": "{}", "port": {}}}],
            "drain_timeout_seconds": 2
        }}"#,
        backend.ip(),
        backend.port()
    );
    fs::write(path, json).expect("write config");
}

fn bump_mtime(path: &std::path::Path) {
    let file = fs::File::options().append(true).open(path).expect("open");
    file.set_modified(SystemTime::now() + Duration::from_secs(2))
        .expect("set mtime");
}

#[test]
fn mtime_reload_reroutes_new_sessions_without_killing_live_ones() {
    let origin_a = HttpOrigin::spawn("origin-a");
    let origin_b = HttpOrigin::spawn("origin-b");

    // The proxy needs a fixed listen port so the rewritten config stays
    // valid; grab an ephemeral port and release it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("fulcrum.json");
    write_config_file(&config_path, port, origin_a.addr);

    let config = Config::load(&config_path).expect("load");
    let proxy = ProxyHandle::spawn(config);

    // A session opened before the reload, kept alive across it.
    let mut pinned = TcpStream::connect(proxy.addr).expect("connect");
    send_request(&mut pinned, "/pinned", "");
    assert_eq!(body_of(&read_response(&mut pinned)), "hello from origin-a");

    // Swap the backend set on disk; the mtime poll picks it up within a
    // couple of housekeeping ticks.
    write_config_file(&config_path, port, origin_b.addr);
    bump_mtime(&config_path);
    thread::sleep(Duration::from_secs(3));

    // New sessions route to the new roster.
    let fresh = harness::http_get(proxy.addr, "/", "Connection: close\r\n");
    assert!(status_line(&fresh).contains("200"));
    assert_eq!(body_of(&fresh), "hello from origin-b");

    // The pre-reload session is still alive and still pinned to its
    // original backend connection.
    send_request(&mut pinned, "/pinned-again", "Connection: close\r\n");
    let pinned_response = read_response(&mut pinned);
    assert_eq!(body_of(&pinned_response), "hello from origin-a");

    assert_eq!(origin_a.connection_count(), 1);
    assert!(origin_b.connection_count() >= 1);
}

#[test]
fn invalid_rewrite_keeps_the_running_configuration() {
    let origin = HttpOrigin::spawn("origin-keep");

    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("fulcrum.json");
    write_config_file(&config_path, port, origin.addr);

    let config = Config::load(&config_path).expect("load");
    let proxy = ProxyHandle::spawn(config);

    // An empty backend list fails validation; the proxy must keep serving
    // with the old roster.
    fs::write(
        &config_path,
        format!(r#"{{"listen_port": {port}, "backends": []}}"#),
    )
    .expect("write");
    bump_mtime(&config_path);
    thread::sleep(Duration::from_secs(3));

    let response = harness::http_get(proxy.addr, "/", "Connection: close\r\n");
    assert_eq!(body_of(&response), "hello from origin-keep");
}
