//! Terminal prompt for disk-space remediation.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use quantforge::{PromptOutcome, RemediationPrompt, RemovalChoice};
use tokio::sync::oneshot;
use tracing::warn;

/// Reads the operator's choice from stdin, giving up at the deadline.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemediationPrompt for TerminalPrompt {
    async fn prompt_with_deadline(
        &self,
        choices: &[RemovalChoice],
        deadline: Duration,
    ) -> PromptOutcome {
        print_choices(choices, deadline);

        // A detached thread: an unanswered read must not block runtime shutdown.
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = std::io::stdin().read_line(&mut line).map(|_| line);
            tx.send(read).ok();
        });

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(line))) => PromptOutcome::Selected(parse_selection(&line, choices)),
            Ok(Ok(Err(e))) => {
                warn!("Could not read from stdin: {}", e);
                PromptOutcome::TimedOut
            }
            Ok(Err(_)) | Err(_) => {
                eprintln!();
                PromptOutcome::TimedOut
            }
        }
    }
}

fn print_choices(choices: &[RemovalChoice], deadline: Duration) {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "Planned quantizations:").ok();
    for (index, choice) in choices.iter().enumerate() {
        writeln!(stderr, "  {}. {}", index + 1, choice.label()).ok();
    }
    write!(
        stderr,
        "Enter the quants to remove (numbers or names, comma separated) within {}s: ",
        deadline.as_secs()
    )
    .ok();
    stderr.flush().ok();
}

/// Map the operator's answer to type names.
///
/// Tokens are separated by commas or whitespace; a number picks the choice
/// at that (1-based) position, anything else is taken as a type name.
fn parse_selection(input: &str, choices: &[RemovalChoice]) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| match token.parse::<usize>() {
            Ok(n) => match choices.get(n.wrapping_sub(1)) {
                Some(choice) => Some(choice.quant.to_string()),
                None => {
                    warn!("No choice numbered {}", n);
                    None
                }
            },
            Err(_) => Some(token.to_uppercase()),
        })
        .collect()
}
