//! rgrid-R command-line behavior via the real binary.

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn run(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_rgrid-R"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn rgrid-R");
    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

const R4: &str = r#"{"version":1,"execution":{"R_lite":[{"rank":"0-3","children":{"core":"0-3"}}],"nodelist":["n[0-3]"]}}"#;

#[test]
fn test_encode_decode() {
    let out = run(
        &["encode", "--ranks", "0-1", "--cores", "0-3", "--hosts", "n[0-1]"],
        "",
    );
    assert!(out.status.success(), "{out:?}");
    let r = stdout(&out);

    let decoded = run(&["decode", "--ranks"], &r);
    assert_eq!(stdout(&decoded), "0-1");
    let counted = run(&["decode", "--count", "core"], &r);
    assert_eq!(stdout(&counted), "8");
    let nodelist = run(&["decode", "--nodelist"], &r);
    assert_eq!(stdout(&nodelist), "n[0-1]");
    let short = run(&["decode", "--short"], &r);
    assert_eq!(stdout(&short), "rank[0-1]/core[0-3]");
}

#[test]
fn test_append_and_diff() {
    let a = r#"{"version":1,"execution":{"R_lite":[{"rank":"0","children":{"core":"0-3"}}],"nodelist":["n0"]}}"#;
    let b = r#"{"version":1,"execution":{"R_lite":[{"rank":"1","children":{"core":"0-3"}}],"nodelist":["n1"]}}"#;
    let appended = run(&["append"], &format!("{a}\n{b}"));
    assert!(appended.status.success());
    let ranks = run(&["decode", "--ranks"], &stdout(&appended));
    assert_eq!(stdout(&ranks), "0-1");

    let diffed = run(&["diff"], &format!("{}\n{}", R4, a));
    let ranks = run(&["decode", "--ranks"], &stdout(&diffed));
    assert_eq!(stdout(&ranks), "1-3");
}

#[test]
fn test_intersect_self_is_identity() {
    let out = run(&["intersect"], &format!("{R4}\n{R4}"));
    assert!(out.status.success());
    let count = run(&["decode", "--count", "core"], &stdout(&out));
    assert_eq!(stdout(&count), "16");
}

#[test]
fn test_rerank_and_errors() {
    let out = run(&["rerank", "--hosts", "n[2-3],n[0-1]"], R4);
    assert!(out.status.success(), "{out:?}");
    let nodelist = run(&["decode", "--nodelist"], &stdout(&out));
    assert_eq!(stdout(&nodelist), "n[2-3],n[0-1]");

    // too few hosts is an error
    let out = run(&["rerank", "--hosts", "n0"], R4);
    assert!(!out.status.success());
}

#[test]
fn test_remap() {
    let sparse = r#"{"version":1,"execution":{"R_lite":[{"rank":"3,9","children":{"core":"2,5"}}],"nodelist":["n[0-1]"]}}"#;
    let out = run(&["remap"], sparse);
    assert!(out.status.success());
    let ranks = run(&["decode", "--ranks"], &stdout(&out));
    assert_eq!(stdout(&ranks), "0-1");
    assert!(stdout(&out).contains("\"core\":\"0-1\""));
}

#[test]
fn test_set_property_and_decode() {
    let out = run(&["set-property", "fast:0,2", "slow:1"], R4);
    assert!(out.status.success());
    let props = run(&["decode", "--properties"], &stdout(&out));
    assert_eq!(stdout(&props), r#"{"fast":"0,2","slow":"1"}"#);
}

#[test]
fn test_verify_exit_codes() {
    let actual_ok = r#"{"version":1,"execution":{"R_lite":[{"rank":"2","children":{"core":"0-3"}}],"nodelist":["n2"]}}"#;
    let out = run(&["verify"], &format!("{R4}\n{actual_ok}"));
    assert!(out.status.success(), "{out:?}");

    let actual_missing = r#"{"version":1,"execution":{"R_lite":[{"rank":"2","children":{"core":"0-1"}}],"nodelist":["n2"]}}"#;
    let out = run(&["verify"], &format!("{R4}\n{actual_missing}"));
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("missing"));
}

#[test]
fn test_parse_config() {
    let conf = r#"[{"hosts": "a[0-1]", "cores": "0-1", "properties": ["login"]}]"#;
    let out = run(&["parse-config", "-"], conf);
    assert!(out.status.success(), "{out:?}");
    let r = stdout(&out);
    let count = run(&["decode", "--count", "core"], &r);
    assert_eq!(stdout(&count), "4");
    let props = run(&["decode", "--properties"], &r);
    assert_eq!(stdout(&props), r#"{"login":"0-1"}"#);
}

#[test]
fn test_bad_input_exits_one() {
    let out = run(&["decode"], "this is not json");
    assert!(!out.status.success());
}
