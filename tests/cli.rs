use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
    sync::Arc,
};

use reqlog::{FileStorage, RequestLogger, RequestSpec};
use serde_json::json;
use tempfile::tempdir;

fn write_config(path: &Path, storage_path: &Path, index_path: Option<&Path>) {
    let mut config = format!(
        r#"
[storage]
backend = "file"
path = "{}"
max_logs = 50

[logging]
level = "warn"
"#,
        storage_path.display()
    );
    if let Some(index_path) = index_path {
        config.push_str(&format!("\n[index]\npath = \"{}\"\n", index_path.display()));
    }
    fs::write(path, config).unwrap();
}

fn run_reqlog<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_reqlog"))
        .args(args)
        .env("HOME", home)
        .env_remove("REQLOG_CONFIG")
        .current_dir(cwd)
        .output()
        .expect("reqlog command should execute")
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

async fn capture_into(storage_path: &Path, specs: Vec<RequestSpec>) -> Vec<String> {
    let logger = RequestLogger::new(Arc::new(FileStorage::open(storage_path).unwrap()));
    let mut ids = Vec::new();
    for spec in specs {
        ids.push(logger.capture(spec).await.unwrap().0);
    }
    ids
}

#[tokio::test]
async fn browse_captured_requests_from_the_command_line() {
    let sandbox = tempdir().unwrap();
    let storage_dir = sandbox.path().join("logs");
    let config_path = sandbox.path().join("custom.toml");
    write_config(
        &config_path,
        &storage_dir,
        Some(&sandbox.path().join("index.db")),
    );

    let ids = capture_into(
        &storage_dir,
        vec![
            RequestSpec::get("https://example.com/users"),
            RequestSpec::post("https://example.com/orders").json(json!({"qty": 2})),
        ],
    )
    .await;

    let config_arg = config_path.as_os_str();
    let listed = stdout_of(&run_reqlog(
        [OsStr::new("--config"), config_arg, OsStr::new("list")],
        sandbox.path(),
        sandbox.path(),
    ));
    assert_eq!(listed, format!("{}\n{}\n", ids[0], ids[1]));

    let shown = stdout_of(&run_reqlog(
        [
            OsStr::new("show"),
            OsStr::new(&ids[1]),
            OsStr::new("--config"),
            config_arg,
        ],
        sandbox.path(),
        sandbox.path(),
    ));
    let record: serde_json::Value = serde_json::from_str(&shown).unwrap();
    assert_eq!(record["json"], json!({"qty": 2}));
    assert_eq!(record["method"], "POST");

    // records captured without the index are invisible to it until rebuilt
    let reindexed = stdout_of(&run_reqlog(
        [OsStr::new("--config"), config_arg, OsStr::new("rebuild-index")],
        sandbox.path(),
        sandbox.path(),
    ));
    assert_eq!(reindexed, "indexed 2 request logs\n");

    let found = stdout_of(&run_reqlog(
        [
            OsStr::new("--config"),
            config_arg,
            OsStr::new("search"),
            OsStr::new("--method"),
            OsStr::new("post"),
        ],
        sandbox.path(),
        sandbox.path(),
    ));
    assert_eq!(found.lines().count(), 1, "{found}");
    assert!(found.contains(&ids[1]), "{found}");

    let deleted = stdout_of(&run_reqlog(
        [
            OsStr::new("--config"),
            config_arg,
            OsStr::new("delete"),
            OsStr::new(&ids[0]),
        ],
        sandbox.path(),
        sandbox.path(),
    ));
    assert_eq!(deleted, format!("deleted request `{}`\n", ids[0]));

    let missing = run_reqlog(
        [
            OsStr::new("--config"),
            config_arg,
            OsStr::new("show"),
            OsStr::new(&ids[0]),
        ],
        sandbox.path(),
        sandbox.path(),
    );
    assert!(!missing.status.success());
    assert!(
        String::from_utf8_lossy(&missing.stderr).contains("was not found"),
        "stderr:\n{}",
        String::from_utf8_lossy(&missing.stderr)
    );
}

#[tokio::test]
async fn config_discovery_prefers_project_then_home() {
    let sandbox = tempdir().unwrap();
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).unwrap();
    fs::create_dir_all(home_dir.join(".reqlog")).unwrap();

    let project_logs = sandbox.path().join("project-logs");
    let home_logs = sandbox.path().join("home-logs");
    write_config(&project_dir.join("reqlog.toml"), &project_logs, None);
    write_config(&home_dir.join(".reqlog").join("config.toml"), &home_logs, None);

    let project_ids =
        capture_into(&project_logs, vec![RequestSpec::get("https://example.com/p")]).await;
    let home_ids = capture_into(&home_logs, vec![RequestSpec::get("https://example.com/h")]).await;

    let from_project = stdout_of(&run_reqlog(["list"], &project_dir, &home_dir));
    assert_eq!(from_project.trim(), project_ids[0]);

    fs::remove_file(project_dir.join("reqlog.toml")).unwrap();
    let from_home = stdout_of(&run_reqlog(["list"], &project_dir, &home_dir));
    assert_eq!(from_home.trim(), home_ids[0]);

    fs::write(project_dir.join("reqlog.toml"), "[storage]\ncolour = \"red\"\n").unwrap();
    let broken = run_reqlog(["list"], &project_dir, &home_dir);
    assert!(!broken.status.success());
    let stderr = String::from_utf8_lossy(&broken.stderr);
    assert!(stderr.contains("project ./reqlog.toml"), "stderr:\n{stderr}");
}
