//! Interactive mirroring session on stdin.
//!
//! Each line is one command: `pause|resume|stop [ids...]`, `status`, `quit`.
//! Leaving the session, by `quit`, end of input or ctrl-c, tears the batch
//! down.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use super::print_records;
use crate::api::Device;
use crate::core::MirrorOrchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Pause(Option<Vec<String>>),
    Resume(Option<Vec<String>>),
    Stop(Option<Vec<String>>),
    Status,
    Help,
    Quit,
}

/// Parse one input line. Blank lines and unknown verbs yield `None`.
pub fn parse_command(line: &str) -> Option<SessionCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next()?.to_lowercase();
    let ids: Vec<String> = words.map(str::to_string).collect();
    let scope = (!ids.is_empty()).then_some(ids);

    match verb.as_str() {
        "pause" | "p" => Some(SessionCommand::Pause(scope)),
        "resume" | "r" => Some(SessionCommand::Resume(scope)),
        "stop" | "s" => Some(SessionCommand::Stop(scope)),
        "status" | "ls" => Some(SessionCommand::Status),
        "help" | "?" => Some(SessionCommand::Help),
        "quit" | "q" | "exit" => Some(SessionCommand::Quit),
        _ => None,
    }
}

const HELP: &str = "commands: pause [ids], resume [ids], stop [ids], status, quit";

pub async fn run(mirror: MirrorOrchestrator, devices: Vec<Device>) -> Result<()> {
    mirror.start(&devices).await;
    show(&mirror).await;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Some(SessionCommand::Pause(scope)) => {
                let n = mirror.pause_all(scope.as_deref()).await;
                println!("paused {n} device(s)");
            }
            Some(SessionCommand::Resume(scope)) => {
                let n = mirror.resume_all(scope.as_deref()).await;
                println!("resumed {n} device(s)");
            }
            Some(SessionCommand::Stop(scope)) => {
                let outcome = mirror.stop_all(scope.as_deref()).await;
                if outcome.failed.is_empty() {
                    println!("stopped {} device(s)", outcome.removed);
                } else {
                    println!("stop failed for {}", outcome.failed.join(", "));
                }
            }
            Some(SessionCommand::Status) => {}
            Some(SessionCommand::Help) => {
                println!("{HELP}");
                continue;
            }
            Some(SessionCommand::Quit) => break,
            None if line.trim().is_empty() => continue,
            None => {
                println!("{HELP}");
                continue;
            }
        }

        show(&mirror).await;
        if mirror.store().len().await == 0 {
            println!("no devices left in the session");
            break;
        }
    }

    if let Err(e) = mirror.teardown().await {
        warn!(error = %e, "Mirroring teardown task failed");
    }
    Ok(())
}

async fn show(mirror: &MirrorOrchestrator) {
    print_records(&mirror.records().await, &mirror.summary().await);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_and_scopes() {
        assert_eq!(parse_command("pause"), Some(SessionCommand::Pause(None)));
        assert_eq!(
            parse_command("  STOP d1 d2 "),
            Some(SessionCommand::Stop(Some(vec!["d1".into(), "d2".into()])))
        );
        assert_eq!(
            parse_command("r d3"),
            Some(SessionCommand::Resume(Some(vec!["d3".into()])))
        );
        assert_eq!(parse_command("q"), Some(SessionCommand::Quit));
        assert_eq!(parse_command("status"), Some(SessionCommand::Status));
    }

    #[test]
    fn blank_and_unknown_lines_are_ignored() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("reboot d1"), None);
    }
}
