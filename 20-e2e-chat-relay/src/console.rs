//! Parsing of terminal input for the chat client.
//!
//! Lines starting with `/` are commands; anything else is a chat draft.

use anyhow::{Result, anyhow};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// A draft to send. May be empty, in which case sending does nothing.
    Say(String),
    Key,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(command) = line.trim().strip_prefix('/') else {
            return Ok(ConsoleCommand::Say(line.to_string()));
        };

        match command.to_ascii_lowercase().as_str() {
            "quit" | "q" => Ok(ConsoleCommand::Quit),
            "key" | "k" => Ok(ConsoleCommand::Key),
            "status" | "s" => Ok(ConsoleCommand::Status),
            "help" | "h" => Ok(ConsoleCommand::Help),
            other => Err(anyhow!("unknown command '/{other}' (try /help)")),
        }
    }
}

pub const HELP: &str = "\
commands:
  /key     show your key snippet
  /status  show connection phase, room and pairing
  /help    show this help
  /quit    leave the chat
anything else is sent to your paired peer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_drafts() {
        assert_eq!(
            ConsoleCommand::parse("hello there\n").unwrap(),
            ConsoleCommand::Say("hello there".into())
        );
    }

    #[test]
    fn empty_line_is_an_empty_draft() {
        assert_eq!(
            ConsoleCommand::parse("\n").unwrap(),
            ConsoleCommand::Say(String::new())
        );
    }

    #[test]
    fn commands_are_case_insensitive_with_aliases() {
        assert_eq!(ConsoleCommand::parse("/QUIT").unwrap(), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("/q").unwrap(), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse(" /status ").unwrap(), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("/k").unwrap(), ConsoleCommand::Key);
        assert_eq!(ConsoleCommand::parse("/help").unwrap(), ConsoleCommand::Help);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(ConsoleCommand::parse("/dance").is_err());
    }
}
