use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_llm_kernel::commands::{user_facing_reply, ReplCommand, HELP_TEXT};
use edge_llm_kernel::engine::TokenConsumer;
use edge_llm_kernel::{ConversationHistory, EngineConfig, LlmEngine, NativeBackends};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_llm_kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path).with_context(|| format!("loading config {}", path))?,
        None => EngineConfig::default(),
    };

    let backends = NativeBackends::from_config(&config);
    let engine = LlmEngine::new(config.clone(), backends).context("creating engine")?;

    if !engine.initialize(config.preferred_backend).wait() {
        anyhow::bail!("no inference backend could be initialized (state: {:?})", engine.state());
    }
    println!("Ready on {:?} backend. Type /help for commands.", engine.current_backend());

    let mut history = ConversationHistory::new();
    let mut params = config.inference;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;

        let command = match ReplCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match command {
            ReplCommand::Empty => {}
            ReplCommand::Help => println!("{}", HELP_TEXT),
            ReplCommand::Quit => break,
            ReplCommand::Reset => {
                history.clear();
                println!("Conversation cleared.");
            }
            ReplCommand::Set(payload) => match params.apply_overrides(&payload) {
                Ok(updated) => {
                    params = updated;
                    println!("{:?}", params);
                }
                Err(e) => println!("{}", e),
            },
            ReplCommand::Backend(None) => {
                println!("backend={:?} state={:?}", engine.current_backend(), engine.state())
            }
            ReplCommand::Backend(Some(preference)) => {
                let ok = engine.initialize(preference).wait();
                println!(
                    "initialize({:?}) -> {} (backend={:?})",
                    preference,
                    ok,
                    engine.current_backend()
                );
            }
            ReplCommand::Stats => {
                println!("{}", serde_json::to_string_pretty(&engine.stats())?);
            }
            ReplCommand::Chat(text) => {
                let printer: TokenConsumer = Box::new(|token: &str| {
                    print!("{}", token);
                    let _ = io::stdout().flush();
                });
                let result = engine
                    .generate_chat(&text, &history, &params, Some(printer))
                    .wait();

                match &result {
                    Ok(outcome) if outcome.text().trim().is_empty() => {
                        println!("{}", user_facing_reply(&result));
                    }
                    Ok(outcome) => {
                        println!();
                        history.push_user(text);
                        history.push_assistant(outcome.text());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "generation failed");
                        println!("{}", user_facing_reply(&result));
                    }
                }
            }
        }
    }

    engine.shutdown();
    Ok(())
}
