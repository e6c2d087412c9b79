use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};

use persona_relay::characters;
use persona_relay::cli::{self, Args, Command};
use persona_relay::logging::{self, CHAT_FILTER, LOG_ENV, SERVE_FILTER};
use persona_relay::repl::{self, ReplCommand};
use persona_relay::{web, ChatSession, InMemoryMessageStore, RelayClient, RelayError, Role};

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let log_override = env_var(LOG_ENV);

    match args.command {
        Command::Serve { config, bind, model } => {
            logging::init_tracing(log_override.as_deref(), SERVE_FILTER);
            let cfg = cli::relay_config(config.as_ref(), bind.as_deref(), model.as_deref(), env_var)?;
            tokio::select! {
                res = web::run(cfg) => res?,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("{}", "  Shutting down.".bright_blue());
                }
            }
        }
        Command::Chat { character, endpoint, config, image_url, name } => {
            logging::init_tracing(log_override.as_deref(), CHAT_FILTER);
            let cfg = cli::client_config(config.as_ref(), endpoint.as_deref(), env_var)?;
            chat(cfg, &character, image_url, name).await?;
        }
        Command::Characters => {
            for p in characters::all() {
                println!(
                    "{:<6} {} {}",
                    p.id.bright_cyan().bold(),
                    p.name.bright_white(),
                    format!("({})", p.title).bright_black()
                );
                println!("       {}", p.tags.join(", ").bright_yellow());
            }
        }
        Command::Completions { shell } => {
            cli::write_completions(shell, &mut io::stdout());
        }
    }

    Ok(())
}

fn print_delta(delta: &str) {
    print!("{}", delta.bright_cyan());
    let _ = io::stdout().flush();
}

fn report(err: &RelayError) {
    println!();
    match err {
        RelayError::Cancelled => eprintln!("{}", "  (reply cancelled)".bright_black()),
        other => eprintln!("{} {}", "error:".bright_red().bold(), other.user_message()),
    }
}

/// Run one exchange, cancelling it on Ctrl+C.
async fn with_interrupt<F>(session: &ChatSession<InMemoryMessageStore>, exchange: F)
where
    F: std::future::Future<Output = persona_relay::Result<String>>,
{
    tokio::pin!(exchange);
    let outcome = tokio::select! {
        res = &mut exchange => res,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            exchange.await
        }
    };
    match outcome {
        Ok(_) => println!(),
        Err(err) => report(&err),
    }
}

async fn chat(
    cfg: persona_relay::ClientConfig,
    character: &str,
    mut first_image: Option<String>,
    sender_name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let persona = characters::resolve(character);
    if characters::try_get(character).is_none() {
        eprintln!(
            "{}",
            format!("  unknown character '{character}', chatting with {}", persona.name).bright_yellow()
        );
    }

    let client = RelayClient::new(cfg)?;
    let store = Arc::new(InMemoryMessageStore::new());
    let conversation = uuid::Uuid::new_v4().to_string();
    let mut session = ChatSession::new(client, store, conversation, persona.id);
    if let Some(name) = sender_name {
        session = session.with_sender_name(name);
    }

    eprintln!("{}", format!("  {} - {}", persona.name, persona.title).bright_magenta().bold());
    eprintln!("{}", "  Type /help for commands.".bright_blue());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", "you>".bright_green().bold());
        io::stdout().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match repl::parse_command(&line) {
            Ok(c) => c,
            Err(msg) => {
                eprintln!("{}", msg.bright_red());
                continue;
            }
        };

        match command {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Help => println!("{}", repl::HELP),
            ReplCommand::Say(text) => {
                let image = first_image.take();
                print!("{} ", format!("{}>", persona.name).bright_magenta().bold());
                with_interrupt(&session, session.send_message(&text, image.as_deref(), print_delta)).await;
            }
            ReplCommand::Image { url, caption } => {
                print!("{} ", format!("{}>", persona.name).bright_magenta().bold());
                with_interrupt(&session, session.send_message(&caption, Some(&url), print_delta)).await;
            }
            ReplCommand::Edit { index, content } => {
                print!("{} ", format!("{}>", persona.name).bright_magenta().bold());
                with_interrupt(&session, session.edit_message(index, &content, print_delta)).await;
            }
            ReplCommand::Retry => {
                print!("{} ", format!("{}>", persona.name).bright_magenta().bold());
                with_interrupt(&session, session.retry_last(print_delta)).await;
            }
            ReplCommand::History => {
                for (i, m) in session.messages().await.iter().enumerate() {
                    let who = match m.role {
                        Role::User => m.sender_name.as_deref().unwrap_or("you").bright_green(),
                        Role::Assistant => persona.name.bright_magenta(),
                    };
                    println!("{:>3} {}: {}", i + 1, who, m.content);
                    if let Some(url) = &m.image_url {
                        println!("      {}", format!("[Image: {url}]").bright_black());
                    }
                }
            }
            ReplCommand::Clear => match session.clear().await {
                Ok(()) => eprintln!("{}", "  conversation cleared".bright_blue()),
                Err(err) => report(&err),
            },
        }
    }

    Ok(())
}
