#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn subwire() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_subwire"));
    command.arg("--log-level").arg("error");
    command
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn version_reports_crate_version() {
    let output = subwire().arg("version").output().expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("subwire {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn stdio_answers_malformed_frames_and_keeps_going() {
    let mut child = subwire()
        .arg("stdio")
        .arg("--backend")
        .arg("memory")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("stdio should start");

    let mut stdin = child.stdin.take().expect("stdin should be piped");
    stdin
        .write_all(b"BOGUS\nSUB a\nPUB a 5\nhello\n")
        .expect("frames should write");
    drop(stdin);

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .expect("stdout should be piped")
        .read_to_string(&mut stdout)
        .expect("stdout should be readable");
    let status = child.wait().expect("stdio should exit");

    assert!(status.success(), "stdio should exit cleanly on EOF");
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("INFO {"), "first frame is INFO: {stdout}");
    assert!(lines[0].contains(r#""name":"subwire-memory""#));
    assert_eq!(lines[1], r#"-ERR "unknown operation 'BOGUS'""#);
    assert!(lines.iter().filter(|line| **line == "+OK").count() >= 2);
}

#[test]
fn pub_without_backend_fails_with_transport_code() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let output = subwire()
        .arg("pub")
        .arg(&addr)
        .arg("t")
        .arg("--data")
        .arg("x")
        .output()
        .expect("pub should run");

    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn serve_pub_sub_roundtrip() {
    let mut server = subwire()
        .arg("--format")
        .arg("raw")
        .arg("serve")
        .arg("127.0.0.1:0")
        .stdout(Stdio::piped())
        .spawn()
        .expect("serve should start");
    let server_stdout = server.stdout.take().expect("stdout should be piped");
    let server = KillOnDrop(server);

    let mut addr = String::new();
    BufReader::new(server_stdout)
        .read_line(&mut addr)
        .expect("serve should announce its address");
    let addr = addr.trim().to_string();

    let subscriber = subwire()
        .arg("--format")
        .arg("raw")
        .arg("sub")
        .arg(&addr)
        .arg("mytopic")
        .arg("--count")
        .arg("1")
        .stdout(Stdio::piped())
        .spawn()
        .expect("sub should start");
    let mut subscriber = KillOnDrop(subscriber);

    // The subscriber may not be registered yet; publish until it exits.
    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let published = subwire()
            .arg("pub")
            .arg(&addr)
            .arg("mytopic")
            .arg("--data")
            .arg("hello")
            .status()
            .expect("pub should run");
        assert!(published.success());

        if let Some(status) = subscriber.0.try_wait().expect("sub status") {
            break status;
        }
        assert!(Instant::now() < deadline, "subscriber never received");
        thread::sleep(Duration::from_millis(100));
    };

    assert!(status.success());
    let mut received = String::new();
    subscriber
        .0
        .stdout
        .take()
        .expect("stdout should be piped")
        .read_to_string(&mut received)
        .expect("sub output should be readable");
    assert_eq!(received, "hello\n");

    drop(server);
}
