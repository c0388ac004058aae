use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn runlogged(dir: &Path, args: &[&str]) -> Output {
	Command::new(env!("CARGO_BIN_EXE_runlogged"))
		.args(["--config", dir.join("none.toml").to_str().unwrap()])
		.args(args)
		.env("RUNLOGGED_LOG", "off")
		.current_dir(dir)
		.output()
		.unwrap()
}

#[test]
fn passes_the_exit_code_through() {
	let dir = tempfile::tempdir().unwrap();
	let out = runlogged(dir.path(), &["--log", "run.log", "echo hi; exit 5"]);

	assert_eq!(out.status.code(), Some(5));
	assert_eq!(String::from_utf8_lossy(&out.stdout).lines().filter(|l| *l == "hi").count(), 1);
	let log = fs::read_to_string(dir.path().join("run.log")).unwrap();
	assert!(log.contains("\nhi\n"));
	assert!(log.ends_with("****** exit code: 5 (failure)\n"));
}

#[test]
fn indicate_success_uses_the_code_lists() {
	let dir = tempfile::tempdir().unwrap();
	let out = runlogged(dir.path(), &["--no-log", "--indicate-success", "--success-codes", "5", "exit 5"]);
	assert_eq!(out.status.code(), Some(0));

	let out = runlogged(dir.path(), &["--no-log", "--indicate-success", "exit 2"]);
	assert_eq!(out.status.code(), Some(1));
}

#[test]
fn time_limit_reports_abort() {
	let dir = tempfile::tempdir().unwrap();
	let out = runlogged(dir.path(), &["--no-log", "--max-duration-sec", "1", "sleep 30"]);
	assert_eq!(out.status.code(), Some(250));
	assert!(String::from_utf8_lossy(&out.stdout).contains("time limit of 1 seconds reached"));
}

#[test]
fn bad_arguments() {
	let dir = tempfile::tempdir().unwrap();
	assert_eq!(runlogged(dir.path(), &["--success-codes", "x", "true"]).status.code(), Some(251));
	assert_eq!(runlogged(dir.path(), &["--cd", "/definitely/missing", "true"]).status.code(), Some(251));
	assert_eq!(runlogged(dir.path(), &["--version"]).status.code(), Some(0));
}

#[test]
fn broken_settings_file_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let settings = dir.path().join("config.toml");
	fs::write(&settings, "[log]\ndays_to_keep = \"many\"").unwrap();

	let out = Command::new(env!("CARGO_BIN_EXE_runlogged"))
		.args(["--config", settings.to_str().unwrap(), "true"])
		.output()
		.unwrap();
	assert_eq!(out.status.code(), Some(251));
	assert!(String::from_utf8_lossy(&out.stderr).contains("failed to parse"));
}

#[test]
fn unopenable_log_file() {
	let dir = tempfile::tempdir().unwrap();
	fs::create_dir(dir.path().join("taken")).unwrap();
	let out = runlogged(dir.path(), &["--log", "taken", "true"]);
	assert_eq!(out.status.code(), Some(252));
}

#[test]
fn command_that_cannot_start() {
	let dir = tempfile::tempdir().unwrap();
	let out = runlogged(dir.path(), &["--no-log", "/definitely/missing/binary"]);
	// the shell starts fine and reports 127 itself
	assert_eq!(out.status.code(), Some(127));
}
