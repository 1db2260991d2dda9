use std::io::Write;
use std::process::Command;

fn actionvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_actionvm"))
}

fn stdout_of(args: &[&str]) -> String {
    let out = actionvm().args(args).output().expect("failed to run actionvm");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

// --- Inline source ---

#[test]
fn inline_prints_returned_value() {
    assert_eq!(stdout_of(&["-e", "push 6, 7\nmultiply\nreturn"]), "42");
}

#[test]
fn inline_undefined_depends_on_version() {
    assert_eq!(stdout_of(&["-e", "push \"nothing\"\ngetvariable\nreturn"]), "undefined");
    assert_eq!(
        stdout_of(&["--swf-version", "6", "-e", "push \"nothing\"\ngetvariable\nreturn"]),
        ""
    );
}

#[test]
fn trace_and_fscommand_go_to_stdout() {
    let source = "
        push \"hello\"
        trace
        geturl \"FSCommand:quit\" \"now\"
    ";
    let stdout = stdout_of(&["-e", source]);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["hello", "fscommand quit now"]);
}

#[test]
fn json_reports_completion_and_stack() {
    let stdout = stdout_of(&["--json", "-e", "push 1, \"two\"\nreturn"]);
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("valid json");
    assert_eq!(report["completion"], "returned");
    assert_eq!(report["value"], "two");
    assert_eq!(report["stack"], serde_json::json!([1.0]));
}

#[test]
fn disasm_lists_instructions() {
    let stdout = stdout_of(&["--disasm", "-e", "push 1\npop"]);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0000: push"), "got: {}", lines[0]);
    assert!(lines[1].ends_with("pop"), "got: {}", lines[1]);
}

// --- Files ---

#[test]
fn asm_file_input() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "push \"a\", \"b\"\nconcat\nreturn").unwrap();
    let path = file.path().to_str().unwrap();
    assert_eq!(stdout_of(&["--asm", path]), "ab");
}

#[test]
fn raw_buffer_input() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    // push int 5; return
    file.write_all(&[0x96, 0x05, 0x00, 0x07, 0x05, 0x00, 0x00, 0x00, 0x3E]).unwrap();
    let path = file.path().to_str().unwrap();
    assert_eq!(stdout_of(&[path]), "5");
}

// --- Failures ---

#[test]
fn missing_file_fails() {
    let out = actionvm().arg("/nonexistent/actions.bin").output().expect("failed to run actionvm");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("error reading"));
}

#[test]
fn bad_assembly_fails() {
    let out = actionvm().args(["-e", "bogus"]).output().expect("failed to run actionvm");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("assembly failed"));
}

#[test]
fn aborted_run_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    // jump far past the end of the buffer
    file.write_all(&[0x99, 0x02, 0x00, 0x00, 0x40]).unwrap();
    let out = actionvm().arg(file.path()).output().expect("failed to run actionvm");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn uncaught_throw_fails() {
    let out = actionvm().args(["-e", "push \"bad\"\nthrow"]).output().expect("failed to run actionvm");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("uncaught exception"));
}
