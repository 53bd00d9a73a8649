//! `switchboard chat`: Interactive or single-message query mode.

use std::io::Write;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use switchboard_core::error::QueryError;
use switchboard_core::message::SessionId;
use switchboard_orchestrator::{QueryOrchestrator, QueryOutcome, QueryRequest};

pub async fn run(
    config_path: Option<&Path>,
    message: Option<String>,
    session: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;

    let mut runtime = switchboard_gateway::runtime_from_config(config).map_err(|e| {
        eprintln!();
        eprintln!("  ERROR: {e}");
        eprintln!();
        eprintln!("  Set SWITCHBOARD_API_KEY (or OPENROUTER_API_KEY / OPENAI_API_KEY),");
        eprintln!("  or add api_key under [inference] in your config file.");
        eprintln!();
        "Inference is not configured. See above for setup instructions."
    })?;
    runtime.start_background();
    let _ = runtime.connect_tool_servers().await;

    let orchestrator = runtime.orchestrator.clone();
    let mut session_id = session.map(SessionId);

    if let Some(msg) = message {
        // Single message mode
        eprint!("  Thinking...");
        let result = ask(&orchestrator, &msg, session_id.clone()).await;
        eprint!("\r              \r");
        match result {
            Ok(outcome) => {
                println!("{}", outcome.response);
                eprintln!("  [session {}]", outcome.session_id);
            }
            Err(e) => {
                runtime.shutdown().await;
                return Err(e.into());
            }
        }
    } else {
        // Interactive mode
        let tools = orchestrator.registry().aggregated_tools().await;
        println!();
        println!("  Switchboard: Interactive Mode");
        println!();
        println!("  Provider:  {}", runtime.config.inference.provider);
        println!("  Model:     {}", runtime.config.inference.model);
        println!("  Tools:     {}", tools.len());
        if let Some(id) = &session_id {
            println!("  Session:   {id}");
        }
        println!();
        println!("  Type your message and press Enter.");
        println!("  Ctrl+C cancels a running query. Type 'exit' to quit.");
        println!();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        prompt()?;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line == "exit" || line == "quit" {
                break;
            }
            if line.is_empty() {
                prompt()?;
                continue;
            }

            eprint!("  ...");
            let result = ask(&orchestrator, line, session_id.clone()).await;
            eprint!("\r     \r");
            match result {
                Ok(outcome) => {
                    println!();
                    for line in outcome.response.lines() {
                        println!("  Assistant > {line}");
                    }
                    println!();
                    session_id = Some(outcome.session_id);
                }
                Err(QueryError::SessionExpiredOrUnknown(id)) => {
                    eprintln!("  [Session {id} expired, starting a new one]");
                    session_id = None;
                }
                Err(e) => {
                    eprintln!("  [Error] {e}");
                    println!();
                }
            }
            prompt()?;
        }

        println!();
        println!("  Goodbye!");
        println!();
    }

    runtime.shutdown().await;
    Ok(())
}

/// Run one query; Ctrl-C cancels it without leaving the chat.
async fn ask(
    orchestrator: &QueryOrchestrator,
    text: &str,
    session_id: Option<SessionId>,
) -> Result<QueryOutcome, QueryError> {
    let mut request = QueryRequest::new(text);
    if let Some(id) = session_id {
        request = request.in_session(id);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let result = orchestrator.query_with_cancel(request, cancel).await;
    watcher.abort();
    result
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}
