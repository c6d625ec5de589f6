use assert_cmd::Command;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixListener;
use std::time::Duration;

fn hrun() -> Command {
    let mut cmd = Command::cargo_bin("hrun").unwrap();
    cmd.env("HOME", std::env::temp_dir())
        .timeout(Duration::from_secs(10));
    cmd
}

#[test]
fn help_succeeds() {
    let output = hrun().arg("--help").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--socket"));
}

#[test]
fn missing_server_fails() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nobody-home.sock");
    let output = hrun()
        .args(["--socket", socket.to_str().unwrap(), "true"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to connect"));
}

#[test]
fn sends_command_record_and_relays_output() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("hrun.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut record = String::new();
        reader.read_line(&mut record).unwrap();
        let mut stream = stream;
        stream.write_all(b"hello from the host\r\n").unwrap();
        record
    });

    let output = hrun()
        .args(["--socket", socket.to_str().unwrap(), "echo", "hi"])
        .output()
        .unwrap();
    let record = server.join().unwrap();

    assert!(output.status.success());
    assert_eq!(record, "{\"Command\":[\"echo\",\"hi\"],\"Width\":0,\"Height\":0}\n");
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello from the host"));
}

#[test]
fn config_file_supplies_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("from-config.sock");
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        format!("[client]\nsocket = \"{}\"\n", socket.display()),
    )
    .unwrap();

    let output = hrun()
        .args(["--config", config.to_str().unwrap(), "true"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("from-config.sock"));
}
