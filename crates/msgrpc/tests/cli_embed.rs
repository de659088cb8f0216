#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use msgrpc_frame::Value;
use msgrpc_peer::{
    dial, EmbedConfig, EmbeddedPeer, EndpointOptions, HandlerError, PeerError, Reply,
};

const BIN: &str = env!("CARGO_BIN_EXE_msgrpc");

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/msgrpc-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if let Ok(endpoint) = dial(path, EndpointOptions::new()) {
            let _ = endpoint.close();
            return;
        }
        if start.elapsed() >= timeout {
            panic!("connect timeout");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn embedded() -> EmbeddedPeer {
    let config = EmbedConfig::new(BIN).with_args(["--log-level", "error"]);
    EmbeddedPeer::spawn(&config, EndpointOptions::new()).expect("embedded peer should start")
}

#[test]
fn embedded_peer_round_trip() {
    let peer = embedded();
    let endpoint = peer.endpoint();

    let sum: i64 = endpoint.call("add", (1, 2)).expect("add should succeed");
    assert_eq!(sum, 3);

    let id = peer.channel_id().expect("channel id should resolve");
    assert!(id > 0);
    assert_eq!(peer.channel_id().unwrap(), id);

    endpoint
        .notify("log", ("info", "hello from the test"))
        .expect("notify should send");

    let status = peer.shutdown().expect("shutdown should succeed");
    assert!(status.success());
}

#[test]
fn embedded_peer_errors_are_per_call() {
    let peer = embedded();
    let endpoint = peer.endpoint();

    let err = endpoint
        .call::<Value>("fail", ("broken on purpose",))
        .expect_err("fail should fail");
    assert!(matches!(err, PeerError::Exception { ref message, .. } if message == "broken on purpose"));

    let err = endpoint
        .call::<Value>("no_such_method", ())
        .expect_err("unknown method should fail");
    assert!(err.to_string().contains("no_such_method"));

    let err = endpoint
        .call::<Value>("add", ("x", 1))
        .expect_err("bad argument should fail");
    assert!(err.to_string().contains("invalid argument"));

    let echoed: Vec<String> = endpoint
        .call("echo", ("still", "alive"))
        .expect("endpoint should survive errors");
    assert_eq!(echoed, vec!["still", "alive"]);

    peer.shutdown().expect("shutdown should succeed");
}

#[test]
fn embedded_peer_pipeline_and_callbacks() {
    let peer = embedded();
    let endpoint = peer.endpoint();
    endpoint
        .register("host_name", || -> Result<&'static str, HandlerError> { Ok("test-host") })
        .expect("register should succeed");

    let mut pipeline = endpoint.pipeline();
    let replies: Vec<Reply<String>> = (0..70)
        .map(|n| pipeline.call("concat", ("n", n.to_string())))
        .collect();
    let nested: Reply<String> = pipeline.call("call_host", ("host_name",));
    pipeline.wait().expect("pipeline should succeed");

    for (n, reply) in replies.iter().enumerate() {
        assert_eq!(reply.take(), Some(format!("n{n}")));
    }
    assert_eq!(nested.take().as_deref(), Some("test-host"));

    peer.shutdown().expect("shutdown should succeed");
}

#[test]
fn call_command_embeds_program() {
    let output = Command::new(BIN)
        .args(["--log-level", "error", "--format", "json", "call", "add", "2", "40"])
        .arg("--program")
        .arg(BIN)
        .args(["--program-arg", "--log-level", "--program-arg", "error"])
        .output()
        .expect("call should run");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"method\":\"add\""), "{stdout}");
    assert!(stdout.contains("\"result\":42"), "{stdout}");
}

#[test]
fn call_command_reports_peer_error() {
    let output = Command::new(BIN)
        .args(["--log-level", "error", "call", "fail", "\"nope\""])
        .arg("--program")
        .arg(BIN)
        .output()
        .expect("call should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nope"), "{stderr}");
}

#[test]
fn call_command_rejects_bad_json() {
    let output = Command::new(BIN)
        .args(["call", "echo", "{not json", "--socket", "/tmp/unused.sock"])
        .output()
        .expect("call should run");

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn serve_socket_accepts_calls() {
    let dir = unique_temp_dir("serve");
    let sock_path = dir.join("peer.sock");

    let mut child = Command::new(BIN)
        .args(["--log-level", "error", "serve", "--socket"])
        .arg(&sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve should start");

    wait_for_socket(&sock_path, Duration::from_secs(3));

    let output = Command::new(BIN)
        .args(["--log-level", "error", "--format", "raw", "call", "concat"])
        .args(["\"a\"", "\"b\"", "\"c\""])
        .arg("--socket")
        .arg(&sock_path)
        .output()
        .expect("call should run");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "abc");

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn no_command_is_usage_error() {
    let output = Command::new(BIN).output().expect("msgrpc should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(BIN)
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}
