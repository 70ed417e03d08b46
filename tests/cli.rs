#![cfg(unix)]

mod common;

use common::{MockModel, final_reply, last_message, tool_call_reply, write_worker_script};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

struct Env {
    dir: tempfile::TempDir,
    config: PathBuf,
}

impl Env {
    fn new(llm_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = write_worker_script(dir.path()).unwrap();
        let config = dir.path().join("toolhost.toml");
        std::fs::write(&config, config_toml(llm_url, &script)).unwrap();
        Self { dir, config }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_toolhost"));
        cmd.arg("--config")
            .arg(&self.config)
            .args(args)
            .env("TOOLHOST_DATA_DIR", self.data_dir())
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().await.unwrap()
    }
}

fn config_toml(llm_url: &str, script: &Path) -> String {
    format!(
        r#"
[agent]
max_iterations = 4

[llm]
base_url = "{llm_url}"
model = "mock"
api_key_env = "TOOLHOST_TEST_KEY"

[[services]]
tag = "notes"
description = "Shell notes worker"
command = "sh"
args = ["{script}"]
"#,
        llm_url = llm_url,
        script = script.display()
    )
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

#[tokio::test]
async fn services_lists_configured_workers() {
    let env = Env::new("http://127.0.0.1:9/v1/chat/completions");
    let out = env.run(&["services"]).await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("notes"));
    assert!(text.contains("Shell notes worker"));
}

#[tokio::test]
async fn credentials_add_list_remove() {
    let env = Env::new("http://127.0.0.1:9/v1/chat/completions");

    let out = env
        .run(&["credentials", "add", "--user", "alice", "--service", "notes", "--refresh-secret", "s3"])
        .await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let secrets: Vec<_> = std::fs::read_dir(env.data_dir().join("secrets")).unwrap().collect();
    assert_eq!(secrets.len(), 1);

    let out = env.run(&["credentials", "list", "--user", "alice"]).await;
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("notes"));
    assert!(text.contains("active"));

    let out = env
        .run(&["credentials", "remove", "--user", "alice", "--service", "notes"])
        .await;
    assert!(out.status.success());
    assert!(std::fs::read_dir(env.data_dir().join("secrets")).unwrap().next().is_none());
}

#[tokio::test]
async fn credentials_add_reads_secret_from_stdin() {
    let env = Env::new("http://127.0.0.1:9/v1/chat/completions");

    let mut child = env
        .command(&["credentials", "add", "--user", "bob", "--service", "notes"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"from-stdin\n").await.unwrap();
    drop(stdin);
    let out = child.wait_with_output().await.unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let path = env.data_dir().join("secrets");
    let file = std::fs::read_dir(&path).unwrap().next().unwrap().unwrap().path();
    let body = std::fs::read_to_string(file).unwrap();
    assert!(body.contains("from-stdin"));
}

#[tokio::test]
async fn ask_answers_with_worker_output() {
    let model = MockModel::start(vec![
        tool_call_reply("call_1", "notes_whoami", json!({})),
        final_reply("done"),
    ])
    .await
    .unwrap();
    let env = Env::new(&model.base_url);

    let out = env
        .run(&["credentials", "add", "--user", "alice", "--service", "notes", "--refresh-secret", "alice-secret"])
        .await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let out = env
        .run(&["ask", "--user", "alice", "--services", "notes", "--prompt", "who am I?"])
        .await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "done");

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    let tool_message = last_message(&requests[1]);
    assert!(tool_message["content"].as_str().unwrap().contains("token=alice-secret"));

    model.stop().await;
}

#[tokio::test]
async fn ask_without_credentials_warns_and_still_answers() {
    let model = MockModel::start(vec![final_reply("no tools today")]).await.unwrap();
    let env = Env::new(&model.base_url);

    let out = env
        .run(&["ask", "--user", "carol", "--services", "notes", "--prompt", "hello"])
        .await;
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "no tools today");
    assert!(stderr(&out).contains("notes"));

    let requests = model.requests();
    assert!(requests[0].get("tools").is_none());
    model.stop().await;
}

#[tokio::test]
async fn ask_fails_when_model_is_unreachable() {
    let env = Env::new("http://127.0.0.1:9/v1/chat/completions");
    let out = env.run(&["ask", "--user", "alice", "--prompt", "hello"]).await;
    assert!(!out.status.success());
    assert!(stderr(&out).contains("language model unavailable"));
}

#[tokio::test]
async fn unknown_command_fails() {
    let env = Env::new("http://127.0.0.1:9/v1/chat/completions");
    let out = env.run(&["frobnicate"]).await;
    assert!(!out.status.success());
    assert!(stderr(&out).contains("frobnicate"));
}
