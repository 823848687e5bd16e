// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use assert_cmd::Command;
use logqueue::qdisk::{QueueFile, QueueFileId};
use predicates::prelude::*;
use tempfile::TempDir;

fn queue_file(dir: &TempDir, count: usize) -> std::path::PathBuf {
    let id = QueueFileId::new(0);
    let path = dir.path().join(id.file_name(false));
    let mut file = QueueFile::create(&path, id, 1024 * 1024, false, false).unwrap();
    for i in 0..count {
        assert!(file.write(format!("message {i}").as_bytes()).unwrap());
    }
    path
}

#[test]
fn test_info_prints_to_stderr() {
    let dir = TempDir::new().unwrap();
    let path = queue_file(&dir, 7);

    Command::cargo_bin("dqtool")
        .unwrap()
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("number_of_messages='7'"));
}

#[test]
fn test_cat_prints_to_stdout_without_modifying_the_file() {
    let dir = TempDir::new().unwrap();
    let path = queue_file(&dir, 3);
    let before = std::fs::read(&path).unwrap();

    Command::cargo_bin("dqtool")
        .unwrap()
        .arg("cat")
        .arg(&path)
        .assert()
        .success()
        .stdout("message 0\nmessage 1\nmessage 2\n");

    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_unreadable_file_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("syslog-ng-00000.qf");
    std::fs::write(&path, b"short").unwrap();

    Command::cargo_bin("dqtool")
        .unwrap()
        .arg("info")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("syslog-ng-00000.qf"));
}
