//! Line-oriented terminal front end over [`ChatSession`].

use crate::db::models::{Message, MessageId};
use crate::error::ChatError;
use crate::session::ChatSession;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  <text>            send a message
  /regen N          regenerate the reply at index N
  /del N            delete the message at index N
  /clear            clear the current conversation
  /stop             stop the reply being generated
  /new              start a new conversation
  /list             list conversations
  /open ID          switch to a conversation
  /context on|off   send the previous reply's context with new prompts
  /quit             exit";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Regenerate(usize),
    Delete(usize),
    Clear,
    Stop,
    New,
    List,
    Open(String),
    Context(bool),
    Help,
    Quit,
    Invalid(String),
}

impl Command {
    pub fn parse(input: &str) -> Command {
        let input = input.trim();
        let Some(rest) = input.strip_prefix('/') else {
            return Command::Send(input.to_string());
        };
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        let index = |arg: Option<&str>| arg.and_then(|a| a.parse::<usize>().ok());

        match (name, arg) {
            ("regen", a) => index(a)
                .map(Command::Regenerate)
                .unwrap_or_else(|| Command::Invalid("usage: /regen N".into())),
            ("del", a) => index(a)
                .map(Command::Delete)
                .unwrap_or_else(|| Command::Invalid("usage: /del N".into())),
            ("clear", _) => Command::Clear,
            ("stop", _) => Command::Stop,
            ("new", _) => Command::New,
            ("list", _) => Command::List,
            ("open", Some(id)) => Command::Open(id.to_string()),
            ("context", Some("on")) => Command::Context(true),
            ("context", Some("off")) => Command::Context(false),
            ("help", _) => Command::Help,
            ("quit", _) | ("exit", _) => Command::Quit,
            _ => Command::Invalid(format!("unknown command: {}", input)),
        }
    }
}

/// Text to print so the terminal catches up with `reply`, given what has
/// already been shown.
pub fn render_delta(shown: &mut Option<(MessageId, String)>, reply: &Message) -> Option<String> {
    let mut out = String::new();
    let previous = match shown {
        Some((id, text)) if *id == reply.id => text.clone(),
        _ => {
            out.push_str("\nassistant: ");
            String::new()
        }
    };

    if reply.error {
        if previous == reply.text {
            return None;
        }
        out.push_str(&format!("[error] {}\n", reply.text));
    } else if let Some(suffix) = reply.text.strip_prefix(previous.as_str()) {
        out.push_str(suffix);
    } else {
        out.push_str("\nassistant: ");
        out.push_str(&reply.text);
    }

    *shown = Some((reply.id, reply.text.clone()));
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

async fn follow_replies(session: Arc<ChatSession>) {
    let mut revisions = session.store().subscribe();
    let mut shown: Option<(MessageId, String)> = None;
    while revisions.changed().await.is_ok() {
        let latest_reply = session.messages().into_iter().rev().find(|m| !m.inversion);
        let Some(reply) = latest_reply else { continue };
        if let Some(text) = render_delta(&mut shown, &reply) {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }
}

fn print_conversation(session: &ChatSession) {
    println!(
        "-- {} [{}] --",
        session.title().unwrap_or_default(),
        session.active_conversation()
    );
    for (index, message) in session.messages().iter().enumerate() {
        let who = if message.inversion { "you" } else { "assistant" };
        let marker = if message.error { " [error]" } else { "" };
        println!(
            "{:>3} {} {}{}: {}",
            index,
            message.date_time.format("%Y-%m-%d %H:%M"),
            who,
            marker,
            message.text
        );
    }
    if session.is_closed() {
        println!("This conversation reached its limit. Type /new to start a new one.");
    }
}

fn spawn_request<F, Fut>(session: &Arc<ChatSession>, run: F)
where
    F: FnOnce(Arc<ChatSession>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<crate::controller::RequestOutcome, ChatError>> + Send + 'static,
{
    let session = session.clone();
    tokio::spawn(async move {
        match run(session).await {
            Ok(outcome) => tracing::debug!(?outcome, "request finished"),
            Err(e) => eprintln!("\n{}", e),
        }
        println!();
    });
}

pub async fn run_terminal(session: Arc<ChatSession>) -> Result<(), ChatError> {
    let follower = tokio::spawn(follow_replies(session.clone()));
    print_conversation(&session);
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Send(text) if text.is_empty() => {}
            Command::Send(text) => {
                spawn_request(&session, move |s| async move { s.submit_user_text(&text).await })
            }
            Command::Regenerate(index) => {
                spawn_request(&session, move |s| async move { s.regenerate(index).await })
            }
            Command::Delete(index) => match session.delete_message(index) {
                Some(_) => print_conversation(&session),
                None => eprintln!("no message at index {}", index),
            },
            Command::Clear => {
                session.clear_conversation();
                print_conversation(&session);
            }
            Command::Stop => {
                if !session.stop_responding() {
                    eprintln!("nothing to stop");
                }
            }
            Command::New => {
                session.start_new_conversation();
                print_conversation(&session);
            }
            Command::List => {
                for entry in session.history() {
                    let marker = if entry.uuid == session.active_conversation() { "*" } else { " " };
                    println!("{} {} {}", marker, entry.uuid, entry.title);
                }
            }
            Command::Open(id) => match id.parse() {
                Ok(uuid) => match session.switch_conversation(uuid) {
                    Ok(()) => print_conversation(&session),
                    Err(e) => eprintln!("{}", e),
                },
                Err(_) => eprintln!("invalid conversation id: {}", id),
            },
            Command::Context(on) => {
                session.set_use_context(on);
                println!("context {}", if on { "on" } else { "off" });
            }
            Command::Help => println!("{}", HELP),
            Command::Invalid(reason) => eprintln!("{}", reason),
            Command::Quit => break,
        }
    }

    session.stop_responding();
    follower.abort();
    Ok(())
}
