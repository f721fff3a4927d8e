use std::collections::HashMap;
use std::io::{self, Write};

use deeplist_chat::{ChatMessage, MessageStatus, Notice, NoticeStatus, Notifier, Role};
use deeplist_storage::MessageId;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    printed: usize,
    finished: bool,
}

/// Prints assistant replies incrementally as the message list changes.
pub struct TranscriptPrinter<W> {
    out: W,
    progress: HashMap<MessageId, Progress>,
}

impl<W: Write> TranscriptPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            progress: HashMap::new(),
        }
    }

    /// Marks `messages` as already shown so later renders skip them.
    pub fn prime(&mut self, messages: &[ChatMessage]) {
        for message in messages {
            self.progress.insert(
                message.id,
                Progress {
                    printed: message.content.len(),
                    finished: true,
                },
            );
        }
    }

    /// Prints `messages` in full and marks them as shown.
    pub fn print_history(&mut self, messages: &[ChatMessage]) -> io::Result<()> {
        for message in messages {
            writeln!(self.out, "{}> {}", speaker(message), message.content)?;
            for attachment in &message.attachments {
                writeln!(self.out, "    [attachment: {}]", attachment.name)?;
            }
        }
        self.prime(messages);
        self.out.flush()
    }

    pub fn render(&mut self, messages: &[ChatMessage]) -> io::Result<()> {
        for message in messages.iter().filter(|message| message.role == Role::Assistant) {
            let progress = self.progress.entry(message.id).or_default();
            if progress.finished {
                continue;
            }
            if progress.printed == 0 && !message.content.is_empty() {
                write!(self.out, "{}> ", speaker(message))?;
            }
            // None when the content was replaced by something shorter.
            if let Some(delta) = message.content.get(progress.printed..) {
                self.out.write_all(delta.as_bytes())?;
            }
            progress.printed = message.content.len();

            match &message.status {
                MessageStatus::Done => writeln!(self.out)?,
                MessageStatus::Error(reason) => writeln!(self.out, "\n[error: {reason}]")?,
                MessageStatus::Cancelled => writeln!(self.out, "\n[stopped]")?,
                MessageStatus::Optimistic | MessageStatus::Pending | MessageStatus::Streaming => {
                    continue;
                }
            }
            progress.finished = true;
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

fn speaker(message: &ChatMessage) -> &str {
    match (&message.role, &message.agent) {
        (Role::Assistant, Some(agent)) => agent.name.as_str(),
        (Role::Assistant, None) => "assistant",
        (Role::User, _) => "you",
        (Role::System, _) => "system",
    }
}

/// Shows notices on stderr and keeps them in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        let marker = match notice.status {
            NoticeStatus::Error => "!",
            NoticeStatus::Info | NoticeStatus::Success => "*",
        };
        match &notice.description {
            Some(description) => eprintln!("{marker} {}: {description}", notice.title),
            None => eprintln!("{marker} {}", notice.title),
        }
        tracing::debug!(title = %notice.title, status = ?notice.status, "notice shown");
    }
}
