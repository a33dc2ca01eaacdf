use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::app::AppContext;
use crate::config::display_db_url;
use crate::delegation::delegation_tool_name;
use crate::history::Message;
use crate::orchestrator::{Orchestrator, TurnRequest};
use crate::streaming::run_turn_streaming;

pub const EXIT_PHRASES: [&str; 4] = ["exit", "quit", "bye", "goodbye"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Help,
    Status,
    Specialists,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChatInput {
    Empty,
    Prompt(String),
    Command(ChatCommand),
    UnknownCommand(String),
}

pub fn is_exit_phrase(input: &str) -> bool {
    let trimmed = input.trim();
    EXIT_PHRASES
        .iter()
        .any(|phrase| trimmed.eq_ignore_ascii_case(phrase))
}

pub fn parse_chat_input(input: &str) -> ParsedChatInput {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ParsedChatInput::Empty;
    }
    if is_exit_phrase(trimmed) {
        return ParsedChatInput::Command(ChatCommand::Exit);
    }
    let Some(slashless) = trimmed.strip_prefix('/') else {
        return ParsedChatInput::Prompt(trimmed.to_string());
    };

    let command = slashless
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match command.as_str() {
        "exit" | "quit" => ParsedChatInput::Command(ChatCommand::Exit),
        "help" => ParsedChatInput::Command(ChatCommand::Help),
        "status" => ParsedChatInput::Command(ChatCommand::Status),
        "specialists" => ParsedChatInput::Command(ChatCommand::Specialists),
        "clear" => ParsedChatInput::Command(ChatCommand::Clear),
        other => ParsedChatInput::UnknownCommand(format!("/{other}")),
    }
}

pub fn print_chat_help() {
    println!("Chat commands:");
    println!("- /help: show command quick reference");
    println!("- /status: show profile, provider, model and stores");
    println!("- /specialists: list active specialists and activation failures");
    println!("- /clear: forget this session's conversation history");
    println!("- exit, quit, bye or goodbye: end the session");
}

/// Conversation state for one interactive session. History lives only in
/// memory and grows by one user/assistant pair per successful turn.
pub struct ChatSession {
    user_id: String,
    history: Vec<Message>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Runs one turn, streaming the answer to `out`. A failed turn is
    /// reported as `[Error] ...` and leaves history untouched.
    pub async fn submit<W: Write>(
        &mut self,
        orchestrator: &Orchestrator,
        prompt: &str,
        out: &mut W,
    ) -> io::Result<bool> {
        write!(out, "\n[Assistant]\n")?;
        out.flush()?;

        let request = TurnRequest {
            user_id: &self.user_id,
            query: prompt,
            history: &self.history,
        };
        let result = run_turn_streaming(orchestrator, request, out).await;
        match result {
            Ok(mut outcome) => {
                self.history.push(Message::user(prompt));
                self.history.push(Message::assistant(outcome.text.clone()));
                orchestrator
                    .commit_turn(&self.user_id, prompt, &mut outcome)
                    .await;
                Ok(true)
            }
            Err(err) => {
                writeln!(out, "\n[Error] {err}")?;
                Ok(false)
            }
        }
    }
}

fn print_status(app: &AppContext, session: &ChatSession) {
    let cfg = &app.cfg;
    println!("Profile: {}", cfg.profile);
    println!("Provider: {:?}", app.provider);
    println!("Model: {}", app.model_name);
    println!("User: {}", cfg.user_id);
    println!(
        "Memory: {} (limit {}, on failure {:?})",
        app.orchestrator.memory().store().backend_name(),
        cfg.memory_limit,
        cfg.memory_failure_policy
    );
    if matches!(cfg.memory_backend, crate::cli::MemoryBackend::Sqlite) {
        println!("Memory db: {}", display_db_url(cfg, &cfg.memory_db_url));
    }
    println!(
        "Specialists: {}/{} active",
        app.specialists.len(),
        app.registry.len()
    );
    println!("History: {} message(s) this session", session.history().len());
}

pub fn print_specialists(app: &AppContext) {
    if app.registry.is_empty() {
        println!(
            "No specialists configured in '{}'.",
            app.cfg.capability_config
        );
        return;
    }
    println!("Active specialists:");
    for specialist in app.specialists.iter() {
        println!(
            "- {} -> {} ({} tool(s))",
            specialist.name(),
            delegation_tool_name(specialist.name()),
            specialist.tool_names().len()
        );
    }
    for failure in app.specialists.failures() {
        println!("- {} [inactive]: {}", failure.specialist, failure.reason);
    }
}

pub async fn run_chat(app: &AppContext) -> Result<()> {
    println!("Business strategist ready. Type /help for commands or 'exit' to quit.");
    if !app.specialists.failures().is_empty() {
        println!(
            "{} specialist(s) failed to start; see /specialists.",
            app.specialists.failures().len()
        );
    }

    let mut session = ChatSession::new(app.cfg.user_id.clone());
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("\n[You] ");
        io::stdout().flush().context("failed to flush stdout")?;
        line.clear();
        let read = stdin
            .read_line(&mut line)
            .context("failed to read input from stdin")?;
        if read == 0 {
            println!("\nGoodbye!");
            break;
        }

        match parse_chat_input(&line) {
            ParsedChatInput::Empty => continue,
            ParsedChatInput::UnknownCommand(command) => {
                println!("Unknown command '{command}'. Use /help.");
            }
            ParsedChatInput::Command(ChatCommand::Exit) => {
                println!("Goodbye!");
                break;
            }
            ParsedChatInput::Command(ChatCommand::Help) => print_chat_help(),
            ParsedChatInput::Command(ChatCommand::Status) => print_status(app, &session),
            ParsedChatInput::Command(ChatCommand::Specialists) => print_specialists(app),
            ParsedChatInput::Command(ChatCommand::Clear) => {
                session.clear();
                println!("Conversation history cleared.");
            }
            ParsedChatInput::Prompt(prompt) => {
                let mut stdout = io::stdout();
                session
                    .submit(&app.orchestrator, &prompt, &mut stdout)
                    .await
                    .context("failed to write response to stdout")?;
            }
        }
    }

    Ok(())
}
