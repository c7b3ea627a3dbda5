//! End-to-end runs of the `ring-latency` binary over the local transport

use std::process::Command;

fn ring_latency(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ring-latency"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_local_run_prints_preamble_records_and_epilogue() {
    let output = ring_latency(&["-n", "4", "-t", "25", "--min-exp", "4", "--max-exp", "6", "-q"]);
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines[0].starts_with("# Version: ring-latency "));
    assert_eq!(lines[1], "# Nr of ranks: 4");
    assert!(lines[2].ends_with(": 0 1 2 3"), "{}", lines[2]);

    let data: Vec<&str> = lines.iter().copied().filter(|l| !l.starts_with('#')).collect();
    let sizes: Vec<&str> = data.iter().map(|l| l.split(' ').next().unwrap()).collect();
    assert_eq!(sizes, vec!["16", "24", "32", "48", "64"]);
    assert_eq!(stdout.matches("# Time for gather ").count(), 5);
    assert_eq!(stdout.matches("# Finalize[").count(), 4);
    assert_eq!(stdout.matches("# Total run time [").count(), 4);
}

#[test]
fn test_random_fill_wait_mode_and_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    let output = ring_latency(&[
        "-r",
        "-s",
        "7",
        "-t",
        "5",
        "-w",
        "2",
        "-n",
        "2",
        "--min-exp",
        "5",
        "--max-exp",
        "5",
        "-o",
        path.to_str().unwrap(),
        "-q",
        "round_trip",
        "round_trip_wait",
    ]);
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let settings = &json["metadata"]["settings"];
    assert_eq!(settings["mode"], "delay_prefixed");
    assert_eq!(settings["random_fill"], true);
    assert_eq!(settings["seed"], 7);
    assert_eq!(settings["wait_us"], 2);
    assert_eq!(json["records"][0]["message_size"], 32);
}

#[test]
fn test_invalid_sweep_bounds_fail() {
    let output = ring_latency(&["--min-exp", "9", "--max-exp", "4", "-q"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("--min-exp"), "{}", stderr);
}

fn run_settings(args: &[&str]) -> serde_json::Value {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let mut argv = vec!["-n", "2", "--min-exp", "4", "--max-exp", "4", "-q", "-o"];
    argv.push(path.to_str().unwrap());
    argv.extend_from_slice(args);

    let output = ring_latency(&argv);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    json["metadata"]["settings"].clone()
}

#[test]
fn test_unparsable_value_leaves_later_arguments_in_effect() {
    let settings = run_settings(&["-t", "abc", "-s", "9", "round_trip_sync"]);
    assert_eq!(settings["trials"], 1000);
    assert_eq!(settings["seed"], 9);
    assert_eq!(settings["mode"], "synchronized");
}

#[test]
fn test_unknown_flag_leaves_later_arguments_in_effect() {
    let settings = run_settings(&["-x", "-t", "3", "round_trip_msg_size"]);
    assert_eq!(settings["trials"], 3);
    assert_eq!(settings["mode"], "size_probed");
}

#[test]
fn test_help_exits_successfully() {
    let output = ring_latency(&["-h"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("round_trip_msg_size"), "{}", stdout);
}
