use anyhow::Result;
use console::style;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::info;

use super::{Runtime, flag_value, parse_service_list, required_flag};
use crate::core::brain::{AgentLoop, AgentOutcome, SessionSeed};
use crate::core::lifecycle::{LifecycleManager, PoolComponent, schedule_credential_purge, shutdown_signal};
use crate::core::llm::Role;
use crate::core::service::ServiceTag;
use crate::core::terminal::{print_info, print_warn};
use crate::core::transcript::{TranscriptStore, history_messages};

const DEFAULT_CONVERSATION: &str = "default";

struct Session {
    user: String,
    conversation: String,
    services: Vec<ServiceTag>,
}

fn parse_session(args: &[String]) -> Result<Session> {
    let user = required_flag(args, 2, &["--user", "-u"])?;
    let services = parse_service_list(&flag_value(args, 2, &["--services", "-s"]).unwrap_or_default())?;
    let conversation = flag_value(args, 2, &["--conversation", "-c"]).unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
    Ok(Session {
        user,
        conversation,
        services,
    })
}

fn report(outcome: &AgentOutcome) {
    if !outcome.unavailable_services.is_empty() {
        let names: Vec<_> = outcome.unavailable_services.iter().map(|s| s.as_str()).collect();
        print_warn(&format!("Unavailable this turn: {}", names.join(", ")));
    }
    if outcome.exhausted {
        print_warn("Tool budget exhausted; answer may be incomplete.");
    }
}

/// One agent turn with transcript read-before and write-after.
async fn run_turn(rt: &Runtime, agent: &AgentLoop, session: &Session, prompt: &str) -> Result<AgentOutcome> {
    let window = rt.config.agent.history_window;
    let turns = rt
        .transcripts
        .recent_turns(&session.user, &session.conversation, window)
        .await?;

    let seed = SessionSeed {
        user_id: session.user.clone(),
        history: history_messages(&turns),
        prompt: prompt.to_string(),
    };
    let outcome = agent.run(seed, &session.services).await?;

    rt.transcripts
        .append_turn(&session.user, &session.conversation, Role::User, prompt)
        .await?;
    rt.transcripts
        .append_turn(&session.user, &session.conversation, Role::Assistant, &outcome.text)
        .await?;
    Ok(outcome)
}

pub(super) async fn ask(rt: &Runtime, args: &[String]) -> Result<()> {
    let session = parse_session(args)?;
    let prompt = required_flag(args, 2, &["--prompt", "-p"])?;

    let pool = rt.pool();
    let agent = rt.agent(pool.clone())?;

    let result = tokio::select! {
        res = run_turn(rt, &agent, &session, &prompt) => Some(res),
        _ = shutdown_signal() => None,
    };
    // No worker may outlive the command.
    pool.shutdown().await;

    match result {
        Some(outcome) => {
            let outcome = outcome?;
            report(&outcome);
            println!("{}", outcome.text);
            Ok(())
        }
        None => Ok(()),
    }
}

pub(super) async fn chat(rt: &Runtime, args: &[String]) -> Result<()> {
    let session = parse_session(args)?;

    let pool = rt.pool();
    let agent = rt.agent(pool.clone())?;

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(PoolComponent::new(pool.clone()))));
    schedule_credential_purge(
        &lifecycle,
        rt.credentials.clone(),
        &rt.config.maintenance.purge_cron,
        rt.config.purge_after(),
    )
    .await?;
    lifecycle.start().await?;

    print_info(&format!(
        "Chatting as {} (conversation '{}'). Type /exit or press Ctrl+C to leave.",
        session.user, session.conversation
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    let result: Result<()> = loop {
        eprint!("{} ", style(">").bold().cyan());
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = &mut signal => break Ok(()),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "/exit" || prompt == "/quit" {
            break Ok(());
        }

        let turn = tokio::select! {
            turn = run_turn(rt, &agent, &session, prompt) => turn,
            _ = &mut signal => break Ok(()),
        };
        match turn {
            Ok(outcome) => {
                report(&outcome);
                println!("{}\n", outcome.text);
            }
            // The model being down ends this turn, not the session.
            Err(e) => print_warn(&format!("{}", e)),
        }
    };

    info!(stats = ?pool.stats().await, "chat session ending");
    lifecycle.shutdown().await?;
    result
}
