//! Supervisor tests against the real server binary.
#![cfg(unix)]

use http_mock_server::{
    ExpectationDefinition, MockServerSet, ProcessError, ProcessState, ReadinessPolicy,
    RequestPredicate, ResponseDefinition, ServerSettings, StopSignal, Supervisor, SupervisorConfig,
};
use std::time::{Duration, Instant};

const BINARY: &str = env!("CARGO_BIN_EXE_http-mock-server");

fn config(name: &str) -> SupervisorConfig {
    SupervisorConfig::new(BINARY).with_server(ServerSettings {
        port: 0,
        name: name.to_string(),
        ..Default::default()
    })
}

fn text_rule(path: &str, text: &str) -> ExpectationDefinition {
    ExpectationDefinition::new(ResponseDefinition::default().with_text(text))
        .when(RequestPredicate::path(path))
}

fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn start_configure_and_stop() {
    let mut server = Supervisor::new(config("default"));
    server.start().unwrap();
    assert_eq!(server.state(), ProcessState::Ready);
    assert!(server.is_running());

    // Starting again is a no-op
    let pid = server.pid().unwrap();
    server.start().unwrap();
    assert_eq!(server.pid(), Some(pid));

    let client = server.client().unwrap();
    client.configure_expectation(&text_rule("/foo", "foo body")).unwrap();
    let response = client.get("/foo").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body().as_ref(), b"foo body");
    assert_eq!(client.latest().unwrap().path, "/foo");

    server
        .stop(Duration::from_secs(5), StopSignal::Terminate)
        .unwrap();
    assert_eq!(server.state(), ProcessState::Stopped);
    assert!(!server.is_running());
    assert!(server.client().is_none());
    assert!(!process_exists(pid));
}

#[test]
fn clean_starts_and_resets() {
    let mut server = Supervisor::new(config("default"));

    server.clean().unwrap();
    let client = server.client().unwrap();
    client.configure_expectation(&text_rule("/foo", "foo body")).unwrap();
    client.get("/foo").unwrap();
    assert_eq!(client.count().unwrap(), 1);

    server.clean().unwrap();
    let client = server.client().unwrap();
    assert_eq!(client.count().unwrap(), 0);
    assert_eq!(client.get("/foo").unwrap().status(), 404);
}

#[test]
fn restart_gives_a_fresh_process() {
    let mut server = Supervisor::new(config("default"));
    server.start().unwrap();
    let old_pid = server.pid().unwrap();
    let old_url = server.base_url();
    server
        .client()
        .unwrap()
        .configure_expectation(&text_rule("/foo", "foo body"))
        .unwrap();

    server.restart().unwrap();

    assert_eq!(server.state(), ProcessState::Ready);
    assert_ne!(server.pid(), Some(old_pid));
    assert_eq!(server.base_url(), old_url);
    assert_eq!(server.client().unwrap().get("/foo").unwrap().status(), 404);
}

#[test]
fn base_path_urls() {
    let mut server = Supervisor::new(SupervisorConfig::new(BINARY).with_server(ServerSettings {
        port: 0,
        base_path: Some("/custom-base-path".to_string()),
        ..Default::default()
    }));
    server.clean().unwrap();

    let client = server.client().unwrap();
    client.configure_expectation(&text_rule("/foo", "/foo body")).unwrap();

    assert!(server.mock_url("/foo").ends_with("/custom-base-path/foo"));
    let response = client.get("/custom-base-path/foo").unwrap();
    assert_eq!(response.body().as_ref(), b"/foo body");
    assert_eq!(client.latest().unwrap().path, "/custom-base-path/foo");
}

#[test]
fn drop_kills_the_child() {
    let pid = {
        let mut server = Supervisor::new(config("default"));
        server.start().unwrap();
        server.pid().unwrap()
    };
    assert!(!process_exists(pid));
}

#[test]
fn program_exiting_early_fails_fast() {
    let mut server = Supervisor::new(SupervisorConfig::new("true").with_server(ServerSettings {
        port: 0,
        ..Default::default()
    }));

    let started = Instant::now();
    let err = server.start().unwrap_err();

    assert!(matches!(err, ProcessError::Exited { .. }), "{err}");
    assert_eq!(server.state(), ProcessState::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn program_never_ready_is_bounded() {
    let mut server = Supervisor::new(
        SupervisorConfig::new("sh")
            .with_args(["-c", "exec sleep 30"])
            .with_server(ServerSettings {
                port: 0,
                ..Default::default()
            })
            .with_readiness(ReadinessPolicy {
                max_elapsed: Duration::from_millis(500),
                ..Default::default()
            }),
    );

    let started = Instant::now();
    let err = server.start().unwrap_err();

    match err {
        ProcessError::NotReady { attempts, .. } => assert!(attempts >= 1),
        other => panic!("expected NotReady, got {other}"),
    }
    assert_eq!(server.state(), ProcessState::Failed);
    assert!(server.pid().is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn named_servers_run_side_by_side() {
    let mut servers = MockServerSet::new();
    servers.insert(Supervisor::new(config("firstNamedServer")));
    servers.insert(Supervisor::new(config("secondNamedServer")));

    servers.clean_all().unwrap();

    let first = servers.get("firstNamedServer").unwrap();
    let second = servers.get("secondNamedServer").unwrap();
    assert_ne!(first.base_url(), second.base_url());

    first
        .client()
        .unwrap()
        .configure_expectation(&text_rule("/foo", "/foo body"))
        .unwrap();
    assert_eq!(
        first.client().unwrap().get("/foo").unwrap().body().as_ref(),
        b"/foo body"
    );
    assert_eq!(second.client().unwrap().get("/foo").unwrap().status(), 404);

    servers.stop_all(Duration::from_secs(5)).unwrap();
    assert_eq!(
        servers.get("firstNamedServer").unwrap().state(),
        ProcessState::Stopped
    );
}
