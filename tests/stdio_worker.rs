#![cfg(unix)]

mod common;

use common::{MockModel, final_reply, last_message, tool_call_reply, write_worker_script};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use toolhost::core::llm::openai::OpenAiCompatProvider;
use toolhost::{
    AgentLoop, AgentSettings, AuthPayload, ConnectionPool, ConnectionState, CredentialStore, PoolError, PoolSettings,
    SecretCipher, ServiceDefinition, ServiceRegistry, ServiceTag, SessionSeed, StdioConnector,
};

struct Stack {
    pool: Arc<ConnectionPool>,
    store: Arc<CredentialStore>,
    _dir: tempfile::TempDir,
}

async fn stack() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let script = write_worker_script(dir.path()).unwrap();

    let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
    let store = CredentialStore::new(db, dir.path().join("secrets"), SecretCipher::with_key([3u8; 32]));
    store.initialize().await.unwrap();
    let store = Arc::new(store);

    let registry = ServiceRegistry::new(vec![ServiceDefinition {
        tag: ServiceTag::new("notes").unwrap(),
        description: "Shell notes worker".into(),
        command: "sh".into(),
        args: vec![script.to_string_lossy().to_string()],
        env: BTreeMap::new(),
        secret_env: "TOOLHOST_SECRET_FILE".into(),
    }]);

    let pool = ConnectionPool::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(StdioConnector::new(Default::default())),
        PoolSettings::default(),
    );
    Stack {
        pool: Arc::new(pool),
        store,
        _dir: dir,
    }
}

fn notes() -> ServiceTag {
    ServiceTag::new("notes").unwrap()
}

#[tokio::test]
async fn worker_reads_its_own_users_secret_file() {
    let s = stack().await;
    s.store.create("alice", &notes(), AuthPayload::new("alice-secret")).await.unwrap();
    s.store.create("bob", &notes(), AuthPayload::new("bob-secret")).await.unwrap();

    let alice = s.pool.get_connection("alice", &notes()).await.unwrap();
    let bob = s.pool.get_connection("bob", &notes()).await.unwrap();
    assert!(!Arc::ptr_eq(&alice, &bob));

    let tools = alice.list_tools().await.unwrap();
    assert_eq!(tools.len(), 2);

    let a = alice.call_tool("whoami", json!({})).await.unwrap();
    let b = bob.call_tool("whoami", json!({})).await.unwrap();
    assert_eq!(a["content"][0]["text"], "token=alice-secret");
    assert_eq!(b["content"][0]["text"], "token=bob-secret");

    let err = alice.call_tool("boom", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("worker failure"));

    s.pool.shutdown().await;
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert_eq!(bob.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn revoked_credentials_stop_new_connections() {
    let s = stack().await;
    s.store.create("alice", &notes(), AuthPayload::new("alice-secret")).await.unwrap();
    s.pool.get_connection("alice", &notes()).await.unwrap();

    s.pool.close_all_for_user("alice").await;
    s.store.delete("alice", &notes()).await.unwrap();

    let err = s.pool.get_connection("alice", &notes()).await.err().unwrap();
    assert!(matches!(err, PoolError::NoCredentials { .. }));
    assert!(std::fs::read_dir(s.store.secrets_dir()).unwrap().next().is_none());
}

#[tokio::test]
async fn missing_secret_file_heals_to_no_credentials() {
    let s = stack().await;
    let credential = s.store.create("alice", &notes(), AuthPayload::new("alice-secret")).await.unwrap();
    std::fs::remove_file(&credential.secret_path).unwrap();

    let err = s.pool.get_connection("alice", &notes()).await.err().unwrap();
    assert!(matches!(err, PoolError::NoCredentials { .. }));
    let listed = s.store.list_for_user("alice").await.unwrap();
    assert!(!listed[0].active);
}

#[tokio::test]
async fn agent_answers_through_a_real_worker() {
    let s = stack().await;
    s.store.create("alice", &notes(), AuthPayload::new("alice-secret")).await.unwrap();

    let model = MockModel::start(vec![
        tool_call_reply("call_1", "notes_boom", json!({})),
        tool_call_reply("call_2", "notes_whoami", json!({})),
        final_reply("Your token is alice-secret."),
    ])
    .await
    .unwrap();
    let provider = OpenAiCompatProvider::new(model.base_url.clone(), "mock", None).unwrap();
    let agent = AgentLoop::new(s.pool.clone(), Arc::new(provider), AgentSettings::default());

    let seed = SessionSeed {
        user_id: "alice".into(),
        history: vec![],
        prompt: "what is my token?".into(),
    };
    let outcome = agent
        .run(seed, &[notes(), ServiceTag::new("mail").unwrap()])
        .await
        .unwrap();

    assert_eq!(outcome.text, "Your token is alice-secret.");
    assert_eq!(outcome.tool_calls, 2);
    assert_eq!(outcome.unavailable_services, vec![ServiceTag::new("mail").unwrap()]);

    let requests = model.requests();
    assert_eq!(requests.len(), 3);
    let tool_names: Vec<_> = requests[0]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["function"]["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tool_names, vec!["notes_whoami", "notes_boom"]);

    let failure = last_message(&requests[1]);
    assert_eq!(failure["role"], "tool");
    assert!(failure["content"].as_str().unwrap().contains("\"kind\":\"invocation\""));

    let success = last_message(&requests[2]);
    assert_eq!(success["tool_call_id"], "call_2");
    assert!(success["content"].as_str().unwrap().contains("token=alice-secret"));

    s.pool.shutdown().await;
    model.stop().await;
}
