use std::path::PathBuf;

use tendlab_core::*;
use tendlab_exec::{ExecError, command_line};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tendlab-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn local_lab(name: &str, extra: &str) -> (Ctx, Lab) {
    let mut config = Config::new();
    config
        .apply_override(&format!(
            "machines.labhost.workdir=@{}",
            scratch(&format!("{name}-wd")).display()
        ))
        .unwrap();
    config.merge(Config::from_toml_str(extra).unwrap());

    let sink = LogSink::new();
    (Ctx::root(sink.clone()), Lab::new(config, sink))
}

fn ended(sink: &LogSink) -> Vec<(String, FrameStatus)> {
    sink.records()
        .into_iter()
        .filter_map(|r| match r {
            LogRecord::TestcaseEnd { name, status, .. } => Some((name, status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_builtin_selftests_on_local_lab() {
    let (ctx, mut lab) = local_lab("selftests", "");
    let registry = Registry::with_builtins();

    registry
        .run(
            &ctx,
            &mut lab,
            &["selftest_channel".to_string(), "selftest_version".to_string()],
        )
        .await
        .unwrap();
    lab.close().await.unwrap();

    let ended = ended(ctx.sink());
    assert!(ended.contains(&("failing".to_string(), FrameStatus::Failed)));
    assert!(ended.contains(&("selftest_version".to_string(), FrameStatus::Ok)));
    assert!(ended.contains(&("selftest_channel".to_string(), FrameStatus::Ok)));
    assert_eq!(ctx.sink().open_frames(), 0);

    let json: serde_json::Value = serde_json::from_str(&ctx.sink().to_json().unwrap()).unwrap();
    assert!(
        json.as_array()
            .unwrap()
            .iter()
            .any(|r| r["type"] == "command" && r["command"] == "uname -n")
    );
}

#[tokio::test]
async fn test_tftp_selftest_with_configured_root() {
    let root = scratch("tftp-root");
    let (ctx, mut lab) = local_lab("tftp", &format!(
        "[tftp]\nroot = {{ path = \"{}\" }}\ndirectory = {{ path = \"board\" }}\n",
        root.display()
    ));

    Registry::with_builtins()
        .run(&ctx, &mut lab, &["selftest_tftp".to_string()])
        .await
        .unwrap();
    lab.close().await.unwrap();

    assert!(root.join("board").is_dir());
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn test_failing_command_is_traced() {
    let (ctx, mut lab) = local_lab("traced", "");

    let err = ctx
        .testcase("deploy", &[("board", "rpi".to_string())], async |ctx| {
            let lh = lab.labhost().await?;
            ctx.testcase("flash", &[], async |_| {
                lh.exec0("(echo partial; exit 3)").await?;
                Ok(())
            })
            .await
        })
        .await
        .unwrap_err();
    lab.close().await.unwrap();

    let names: Vec<_> = err.trace().unwrap().iter().map(|f| f.name.clone()).collect();
    assert_eq!(names, vec!["deploy", "flash"]);
    assert!(matches!(
        err.as_exec(),
        Some(ExecError::CommandFailed { status: 3, output, .. }) if output == "partial\n"
    ));

    let report = err.trace_report();
    assert!(report.starts_with("deploy(board=rpi)\n  flash()\n"));
    assert!(report.contains("[labhost] (echo partial; exit 3)"));
    assert!(report.contains("  | partial"));
}

#[tokio::test]
async fn test_missing_build_artifact_setting() {
    let (ctx, mut lab) = local_lab("artifact", "");

    let err = Registry::with_builtins()
        .run(&ctx, &mut lab, &["stage_artifact".to_string()])
        .await
        .unwrap_err();
    lab.close().await.unwrap();

    assert!(matches!(
        err.root(),
        Error::Config(ConfigError::Missing(key)) if key == "build.artifact"
    ));
}

#[tokio::test]
#[ignore = "requires dropbear on this host and key based ssh login to localhost"]
async fn test_minisshd_end_to_end() {
    let (ctx, mut lab) = local_lab("minisshd", "[minisshd]\nport = 2022\n");

    Registry::with_builtins()
        .run(&ctx, &mut lab, &["selftest_minisshd".to_string()])
        .await
        .unwrap();

    let labhost = lab.labhost().await.unwrap();
    let pid_file = labhost.workdir().unwrap().join("minisshd/dropbear.pid");
    let pid = minisshd(&ctx, labhost, 2022, async |_, ssh| {
        assert_eq!(ssh.exec0("echo over ssh").await?, "over ssh\n");
        let pid = ssh
            .exec0(&command_line(&["cat", &pid_file.to_string_lossy()]))
            .await?;
        pid.trim()
            .parse::<u32>()
            .map_err(|e| Error::Assertion(format!("bad pid {pid:?}: {e}")))
    })
    .await
    .unwrap();
    lab.close().await.unwrap();

    assert!(
        ctx.sink()
            .records()
            .iter()
            .any(|r| matches!(r, LogRecord::Command { machine, .. } if machine == "minissh-local"))
    );

    let mut gone = false;
    for _ in 0..20 {
        gone = !std::path::Path::new(&format!("/proc/{pid}")).exists()
            || std::fs::read_to_string(format!("/proc/{pid}/status"))
                .is_ok_and(|s| s.lines().any(|l| l.starts_with("State:") && l.contains('Z')));
        if gone {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(gone, "dropbear {pid} still running after teardown");
}
