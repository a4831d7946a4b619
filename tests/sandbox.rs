//! End-to-end sandbox tests
//!
//! Full-stack scenarios: commands go through the shell guest, the
//! kernel, the pipes, and the VFS, and only the facade is touched.

use std::rc::Rc;

use shellbox::{ManualClock, Sandbox, SandboxError, SandboxOptions};

fn sandbox() -> Sandbox {
    Sandbox::create(SandboxOptions::new()).unwrap()
}

#[test]
fn simple_pipeline() {
    let sandbox = sandbox();
    let result = sandbox.run("echo hello | cat").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
}

#[test]
fn external_pipeline_seq_head() {
    let sandbox = sandbox();
    let result = sandbox.run("seq 1 1000 | head -5").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "1\n2\n3\n4\n5\n");
}

#[test]
fn early_close_propagates_epipe_upstream() {
    let sandbox = sandbox();
    // Far more than one pipe buffer: the producer must stop on EPIPE
    // once the consumer is gone, or this would crawl through 100k lines.
    let result = sandbox.run("seq 1 100000 | head -5").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "1\n2\n3\n4\n5\n");
}

#[test]
fn yes_head_terminates() {
    let sandbox = sandbox();
    let result = sandbox.run("yes | head -3").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "y\ny\ny\n");
}

#[test]
fn device_read_zero() {
    let sandbox = sandbox();
    let result = sandbox.run("head -c 4 /dev/zero | xxd -p").unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.starts_with("00000000"));
}

#[test]
fn dev_null_discards() {
    let sandbox = sandbox();
    let result = sandbox.run("echo discarded > /dev/null").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "");
}

#[test]
fn proc_files_are_readable_not_writable() {
    let sandbox = sandbox();
    let result = sandbox.run("cat /proc/version").unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("shellbox"));

    let result = sandbox.run("echo nope > /proc/uptime").unwrap();
    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("EROFS"));
}

#[test]
fn persistence_round_trip() {
    let first = sandbox();
    first.write_file("/home/user/a.txt", b"abc").unwrap();
    first.set_env("CARRIED", "over").unwrap();
    let blob = first.export_state().unwrap();

    let second = sandbox();
    second.import_state(&blob).unwrap();
    assert_eq!(second.read_file("/home/user/a.txt").unwrap(), b"abc");
    assert_eq!(
        second.get_env("CARRIED").unwrap(),
        Some("over".to_string())
    );

    let result = second.run("cat /home/user/a.txt").unwrap();
    assert_eq!(result.stdout, "abc");
}

#[test]
fn corrupted_blob_rejected() {
    let first = sandbox();
    first.write_file("/home/user/x", b"data").unwrap();
    let mut blob = first.export_state().unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x55;

    let second = sandbox();
    let err = second.import_state(&blob).unwrap_err();
    assert!(matches!(err, SandboxError::CorruptedState(_)));
}

#[test]
fn timeout_produces_124() {
    let clock = ManualClock::new();
    let sandbox = Sandbox::create(
        SandboxOptions::new()
            .timeout_ms(100)
            .clock(Rc::new(clock)),
    )
    .unwrap();
    let result = sandbox.run("yes | head -c 1 >/dev/null; sleep 5").unwrap();
    assert_eq!(result.exit_code, 124);
    assert!(result.stderr.contains("timed out"));
}

#[test]
fn sleep_within_deadline_succeeds() {
    let clock = ManualClock::new();
    let sandbox = Sandbox::create(
        SandboxOptions::new()
            .timeout_ms(10_000)
            .clock(Rc::new(clock)),
    )
    .unwrap();
    let result = sandbox.run("sleep 0.2; echo awake").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "awake\n");
}

#[test]
fn unknown_command_is_127() {
    let sandbox = sandbox();
    let result = sandbox.run("no-such-tool").unwrap();
    assert_eq!(result.exit_code, 127);
    assert!(result.stderr.contains("command not found"));
}

#[test]
fn exit_codes_flow_through() {
    let sandbox = sandbox();
    assert_eq!(sandbox.run("true").unwrap().exit_code, 0);
    assert_eq!(sandbox.run("false").unwrap().exit_code, 1);
    assert_eq!(sandbox.run("exit 5").unwrap().exit_code, 5);
}

#[test]
fn variables_and_expansion() {
    let sandbox = sandbox();
    let result = sandbox.run("X=world; echo hello $X").unwrap();
    assert_eq!(result.stdout, "hello world\n");

    // State persists across commands in the same shell.
    let result = sandbox.run("echo again: $X").unwrap();
    assert_eq!(result.stdout, "again: world\n");

    let result = sandbox.run("echo ${MISSING:-fallback}").unwrap();
    assert_eq!(result.stdout, "fallback\n");
}

#[test]
fn env_sync_between_host_and_shell() {
    let sandbox = sandbox();
    sandbox.set_env("FROM_HOST", "42").unwrap();
    let result = sandbox.run("echo $FROM_HOST").unwrap();
    assert_eq!(result.stdout, "42\n");

    sandbox.run("FROM_SHELL=99").unwrap();
    assert_eq!(
        sandbox.get_env("FROM_SHELL").unwrap(),
        Some("99".to_string())
    );
}

#[test]
fn command_substitution() {
    let sandbox = sandbox();
    let result = sandbox.run("echo got:$(echo inner)").unwrap();
    assert_eq!(result.stdout, "got:inner\n");

    let result = sandbox.run("echo $(echo a $(echo b))").unwrap();
    assert_eq!(result.stdout, "a b\n");
}

#[test]
fn quoting_rules() {
    let sandbox = sandbox();
    let result = sandbox.run("X=v; echo '$X' \"$X\"").unwrap();
    assert_eq!(result.stdout, "$X v\n");
}

#[test]
fn redirects_to_files() {
    let sandbox = sandbox();
    sandbox.run("echo one > /home/user/out.txt").unwrap();
    sandbox.run("echo two >> /home/user/out.txt").unwrap();
    let result = sandbox.run("cat /home/user/out.txt").unwrap();
    assert_eq!(result.stdout, "one\ntwo\n");

    let result = sandbox.run("sort < /home/user/out.txt").unwrap();
    assert_eq!(result.stdout, "one\ntwo\n");
}

#[test]
fn stderr_redirect_into_stdout() {
    let sandbox = sandbox();
    let result = sandbox
        .run("cat /home/user/missing 2>&1 | grep -i enoent")
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.to_lowercase().contains("enoent"));
}

#[test]
fn globbing_against_vfs() {
    let sandbox = sandbox();
    sandbox.run("touch a.txt b.txt c.log").unwrap();
    let result = sandbox.run("echo *.txt").unwrap();
    assert_eq!(result.stdout, "a.txt b.txt\n");

    // No match keeps the pattern literally.
    let result = sandbox.run("echo *.zip").unwrap();
    assert_eq!(result.stdout, "*.zip\n");
}

#[test]
fn control_flow_constructs() {
    let sandbox = sandbox();
    let result = sandbox
        .run("if [ 1 -eq 1 ]; then echo yes; else echo no; fi")
        .unwrap();
    assert_eq!(result.stdout, "yes\n");

    let result = sandbox
        .run("if [ -f /home/user/absent ]; then echo have; else echo miss; fi")
        .unwrap();
    assert_eq!(result.stdout, "miss\n");

    let result = sandbox.run("for f in a b c; do echo item:$f; done").unwrap();
    assert_eq!(result.stdout, "item:a\nitem:b\nitem:c\n");
}

#[test]
fn while_loop_with_break() {
    let sandbox = sandbox();
    let result = sandbox
        .run("while true; do echo once; break; done; echo after")
        .unwrap();
    assert_eq!(result.stdout, "once\nafter\n");
}

#[test]
fn subshell_isolation() {
    let sandbox = sandbox();
    let result = sandbox.run("(cd /tmp && pwd); pwd").unwrap();
    assert_eq!(result.stdout, "/tmp\n/home/user\n");

    let result = sandbox.run("(X=inner); echo [$X]").unwrap();
    assert_eq!(result.stdout, "[]\n");
}

#[test]
fn functions_and_positional_params() {
    let sandbox = sandbox();
    let result = sandbox
        .run("greet() { echo hi $1; }; greet alice; greet bob")
        .unwrap();
    assert_eq!(result.stdout, "hi alice\nhi bob\n");
}

#[test]
fn and_or_lists() {
    let sandbox = sandbox();
    let result = sandbox.run("true && echo both || echo fallback").unwrap();
    assert_eq!(result.stdout, "both\n");

    let result = sandbox.run("false && echo both || echo fallback").unwrap();
    assert_eq!(result.stdout, "fallback\n");
}

#[test]
fn pipefail_flag() {
    let sandbox = sandbox();
    let result = sandbox.run("false | true").unwrap();
    assert_eq!(result.exit_code, 0);

    let result = sandbox.run("set -o pipefail; false | true").unwrap();
    assert_eq!(result.exit_code, 1);
}

#[test]
fn errexit_flag() {
    let sandbox = sandbox();
    let result = sandbox.run("set -e; false; echo unreachable").unwrap();
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "");

    // Suppressed inside conditions.
    let result = sandbox
        .run("set -e; if false; then echo no; fi; echo reached")
        .unwrap();
    assert_eq!(result.stdout, "reached\n");
}

#[test]
fn last_exit_code_variable() {
    let sandbox = sandbox();
    let result = sandbox.run("false; echo code=$?").unwrap();
    assert_eq!(result.stdout, "code=1\n");
}

#[test]
fn syntax_error_is_2() {
    let sandbox = sandbox();
    let result = sandbox.run("if true; then").unwrap();
    assert_eq!(result.exit_code, 2);
    assert!(result.stderr.contains("syntax error"));
}

#[test]
fn facade_filesystem_surface() {
    let sandbox = sandbox();
    sandbox.mkdir("/home/user/docs").unwrap();
    sandbox.write_file("/home/user/docs/n.txt", b"note").unwrap();
    assert_eq!(sandbox.read_file("/home/user/docs/n.txt").unwrap(), b"note");

    let meta = sandbox.stat("/home/user/docs/n.txt").unwrap();
    assert!(meta.is_file);
    assert_eq!(meta.size, 4);

    let names: Vec<String> = sandbox
        .read_dir("/home/user/docs")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["n.txt"]);

    sandbox.rm("/home/user/docs").unwrap();
    assert!(sandbox.stat("/home/user/docs").is_err());
}

#[test]
fn facade_write_outside_writable_set_is_erofs() {
    let sandbox = sandbox();
    let err = sandbox.write_file("/etc/hosts", b"nope").unwrap_err();
    assert!(err.to_string().contains("EROFS"));
}

#[test]
fn named_shells_have_separate_state() {
    let sandbox = sandbox();
    sandbox.run_in_shell("a", "X=from_a").unwrap();
    let result = sandbox.run_in_shell("b", "echo [$X]").unwrap();
    assert_eq!(result.stdout, "[]\n");
    let result = sandbox.run_in_shell("a", "echo [$X]").unwrap();
    assert_eq!(result.stdout, "[from_a]\n");
}

#[test]
fn destroy_latches() {
    let sandbox = sandbox();
    sandbox.run("echo alive").unwrap();
    sandbox.destroy();
    assert!(matches!(
        sandbox.run("echo dead"),
        Err(SandboxError::Destroyed)
    ));
    assert!(matches!(
        sandbox.read_file("/home/user"),
        Err(SandboxError::Destroyed)
    ));
}

#[test]
fn output_truncation_flag() {
    let sandbox = Sandbox::create(SandboxOptions::new().output_cap_bytes(16)).unwrap();
    let result = sandbox.run("seq 1 100").unwrap();
    assert!(result.truncated);
    assert!(result.stdout.len() <= 16);
}

#[test]
fn tool_gating_via_packages() {
    let sandbox = sandbox();
    assert!(sandbox.has_tool("cat"));
    assert!(!sandbox.has_tool("imaginary"));
}

#[test]
fn wc_pipeline() {
    let sandbox = sandbox();
    let result = sandbox.run("seq 1 10 | wc -l").unwrap();
    assert_eq!(result.stdout, "10\n");
}

#[test]
fn three_stage_pipeline() {
    let sandbox = sandbox();
    let result = sandbox
        .run("seq 1 20 | grep 1 | wc -l")
        .unwrap();
    // 1, 10..19 → 11 lines containing "1".
    assert_eq!(result.stdout, "11\n");
}

#[test]
fn builtin_in_pipeline() {
    let sandbox = sandbox();
    let result = sandbox.run("echo b,a,c | tr , '\n' | sort").unwrap();
    assert_eq!(result.stdout, "a\nb\nc\n");
}

#[test]
fn interpreter_guest_reaches_network_and_extensions() {
    use shellbox::{Capability, FetchRequest, FetchResponse, GuestCtx, HttpFetcher};
    use std::future::Future;
    use std::pin::Pin;

    struct Canned;
    impl HttpFetcher for Canned {
        fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, String> {
            Ok(FetchResponse {
                status: 200,
                headers: Vec::new(),
                body: b"payload".to_vec(),
                error: None,
            })
        }
    }

    fn netprobe(ctx: GuestCtx) -> Pin<Box<dyn Future<Output = i32>>> {
        Box::pin(async move {
            let abi = ctx.abi();
            let response = abi
                .network_fetch(FetchRequest {
                    url: "https://api.example.com/data".to_string(),
                    method: "GET".to_string(),
                    headers: Vec::new(),
                    body: None,
                })
                .await
                .unwrap();
            let tagged = abi
                .extension_invoke("tag", &String::from_utf8_lossy(&response.body))
                .unwrap();
            ctx.host.fd_write(1, tagged.as_bytes()).await.unwrap();
            i32::from(response.status != 200)
        })
    }

    let sandbox = Sandbox::create(
        SandboxOptions::new()
            .allowed_hosts(vec!["example.com".to_string()])
            .fetcher(Box::new(Canned)),
    )
    .unwrap();
    sandbox
        .register_extension("tag", Box::new(|payload| Ok(format!("tagged:{}", payload))))
        .unwrap();
    sandbox
        .register_program("netprobe", netprobe, Capability::interpreter_set(), true)
        .unwrap();

    let result = sandbox.run("netprobe").unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "tagged:payload");
}

#[test]
fn tool_denied_by_capability_matrix_is_126() {
    use shellbox::{Capability, GuestCtx};
    use std::future::Future;
    use std::pin::Pin;

    fn locked(_ctx: GuestCtx) -> Pin<Box<dyn Future<Output = i32>>> {
        Box::pin(async { 0 })
    }

    let sandbox = sandbox();
    sandbox
        .register_program("locked-tool", locked, Capability::tool_set(), false)
        .unwrap();
    let result = sandbox.run("locked-tool").unwrap();
    assert_eq!(result.exit_code, 126);
}

#[test]
fn read_builtin_from_pipe() {
    let sandbox = sandbox();
    let result = sandbox
        .run("echo value | { read V; echo got=$V; }")
        .unwrap();
    assert_eq!(result.stdout, "got=value\n");
}
