use std::path::PathBuf;

pub const HELP: &str = "\
Type a message and press enter to send it. An empty line sends
attached files on their own.

  /new              start a new conversation
  /chats            list your conversations
  /open <chat-id>   switch to a conversation
  /attach <path>    attach a file to the next message
  /send [text]      send text and attachments; text may be empty
  /suggest <text>   send a suggested prompt
  /reload           regenerate the last reply
  /stop             stop the streaming reply
  /models           list available models
  /model <id>       switch model
  /help             show this help
  /quit             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Send(String),
    New,
    Chats,
    Open(String),
    Attach(PathBuf),
    Suggest(String),
    Reload,
    Stop,
    Models,
    Model(String),
    Help,
    Quit,
    /// A slash command that is unknown or missing its argument.
    Invalid(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.trim_start().strip_prefix('/') else {
            return Self::Send(line.to_string());
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        let with_argument = |build: fn(String) -> Self| {
            if argument.is_empty() {
                Self::Invalid(format!("/{name} needs an argument"))
            } else {
                build(argument.to_string())
            }
        };

        match name {
            "new" => Self::New,
            "chats" => Self::Chats,
            "open" => with_argument(Self::Open),
            "attach" => with_argument(|path| Self::Attach(PathBuf::from(path))),
            "send" => Self::Send(argument.to_string()),
            "suggest" => with_argument(Self::Suggest),
            "reload" => Self::Reload,
            "stop" => Self::Stop,
            "models" => Self::Models,
            "model" => with_argument(Self::Model),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Invalid(format!("unknown command /{name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent_verbatim() {
        assert_eq!(
            Command::parse("  hello there  \n"),
            Command::Send("  hello there  ".to_string())
        );
        assert_eq!(Command::parse("   "), Command::Empty);
    }

    #[test]
    fn commands_take_trimmed_arguments() {
        assert_eq!(
            Command::parse("/attach  ./notes.txt "),
            Command::Attach(PathBuf::from("./notes.txt"))
        );
        assert_eq!(
            Command::parse("/suggest What is Rust?"),
            Command::Suggest("What is Rust?".to_string())
        );
        assert_eq!(Command::parse("/exit"), Command::Quit);
    }

    #[test]
    fn send_command_accepts_an_empty_message() {
        assert_eq!(Command::parse("/send"), Command::Send(String::new()));
        assert_eq!(
            Command::parse("/send  see attached "),
            Command::Send("see attached".to_string())
        );
    }

    #[test]
    fn missing_arguments_and_unknown_commands_are_invalid() {
        assert!(matches!(Command::parse("/open"), Command::Invalid(_)));
        assert!(matches!(Command::parse("/frobnicate"), Command::Invalid(_)));
    }
}
