use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

use parley_agent::{AgentRuntime, TurnOutcome};
use parley_core::config::LoadOptions;

use crate::bootstrap::{bootstrap, current_thread_runtime};
use crate::commands::CommandResult;

const EXIT_COMMAND: &str = "/exit";

pub fn run(session: Option<String>, user: &str) -> CommandResult {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("chat", &error),
    };
    let session = session.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));

    runtime.block_on(async {
        let app = match bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return CommandResult::from_bootstrap("chat", &error),
        };
        let agent = match app.agent_runtime() {
            Ok(agent) => agent,
            Err(error) => return CommandResult::from_bootstrap("chat", &error),
        };

        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let turns = converse(&agent, &session, user, stdin, &mut stdout).await;
        app.db_pool.close().await;

        match turns {
            Ok(turns) => CommandResult::success(
                "chat",
                format!("session {session} ended after {turns} turns"),
            ),
            Err(error) => CommandResult::failure("chat", "io", format!("{error:#}"), 7),
        }
    })
}

/// Feeds each non-empty input line to the runtime and writes the reply.
/// Stops at end of input or `/exit`; returns the number of turns taken.
pub async fn converse<R, W>(
    agent: &AgentRuntime,
    session: &str,
    user: &str,
    input: R,
    output: &mut W,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut turns = 0;

    output
        .write_all(format!("session {session}; type {EXIT_COMMAND} to leave\n").as_bytes())
        .await
        .context("writing the banner")?;

    while let Some(line) = lines.next_line().await.context("reading input")? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == EXIT_COMMAND {
            break;
        }

        let outcome = agent.process(message, session, user).await;
        turns += 1;
        output.write_all(render(&outcome).as_bytes()).await.context("writing a reply")?;
        output.flush().await.context("flushing output")?;
    }
    Ok(turns)
}

fn render(outcome: &TurnOutcome) -> String {
    match outcome {
        TurnOutcome::Complete { message, data } if !data.is_null() => {
            format!("parley> {message}\n        {data}\n")
        }
        TurnOutcome::Failure { message } => format!("parley> [failed] {message}\n"),
        other => format!("parley> {}\n", other.message()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use parley_agent::{AgentRuntime, InMemoryPeerTransport, ScriptedLlmClient, TurnOutcome};
    use parley_db::{connect_in_memory, migrations, DemoLedger, InMemoryContextStore};

    use super::{converse, render};

    async fn demo_runtime() -> AgentRuntime {
        let pool = connect_in_memory().await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let demo = DemoLedger::new(pool);
        demo.seed().await.expect("seed");
        AgentRuntime::builder(Arc::new(demo.registry()), Arc::new(InMemoryContextStore::new()))
            .llm(Arc::new(ScriptedLlmClient::new()))
            .transport(Arc::new(InMemoryPeerTransport::new()))
            .workflows(demo.workflows())
            .build()
            .expect("runtime")
    }

    #[tokio::test]
    async fn converse_answers_each_line_and_stops_at_exit() {
        let agent = demo_runtime().await;
        let input: &[u8] = b"create invoice\n\n/exit\nnever read\n";
        let mut output = Vec::new();

        let turns = converse(&agent, "S-cli", "tester", input, &mut output).await.expect("chat");
        assert_eq!(turns, 1);

        let text = String::from_utf8(output).expect("utf8");
        assert!(text.starts_with("session S-cli; type /exit to leave\n"));
        assert!(text.contains("parley> Which customer is this invoice for?\n"));
        assert!(!text.contains("never read"));
    }

    #[test]
    fn render_marks_failures_and_prints_completion_data() {
        let failed = TurnOutcome::Failure { message: "Okay, I cancelled that.".to_string() };
        assert_eq!(render(&failed), "parley> [failed] Okay, I cancelled that.\n");

        let done = TurnOutcome::Complete {
            message: "Created Invoice #1.".to_string(),
            data: json!({"id": 1}),
        };
        assert_eq!(render(&done), "parley> Created Invoice #1.\n        {\"id\":1}\n");
    }
}
