//! Markdown rendering of canonical conversations.

use std::io::Write;

use chrono::{DateTime, Local, Utc};

use crate::reconcile::{Conversation, Role};

fn display_time(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Write one conversation as a standalone Markdown document.
pub fn write_conversation_markdown<W: Write>(
    writer: &mut W,
    conversation: &Conversation,
) -> std::io::Result<()> {
    writeln!(writer, "# {}", conversation.title)?;
    writeln!(writer)?;
    writeln!(writer, "Created: {}", display_time(conversation.created_at))?;
    writeln!(
        writer,
        "Last Updated: {}",
        display_time(conversation.last_updated_at)
    )?;
    writeln!(writer)?;

    if let Some(summary) = &conversation.summary {
        writeln!(writer, "> {}", summary)?;
        writeln!(writer)?;
    }

    for msg in &conversation.messages {
        writeln!(writer, "### {}", msg.role.display_name())?;
        writeln!(writer)?;
        if msg.content.is_empty() && msg.role == Role::Assistant {
            // Empty-content messages are dropped during normalization; this
            // only renders for conversations assembled by hand.
            writeln!(writer, "*(no response recorded)*")?;
        } else {
            writeln!(writer, "{}", msg.content)?;
        }
        writeln!(writer)?;
        writeln!(writer, "---")?;
        writeln!(writer)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Message, MessageSource};
    use chrono::TimeZone;

    fn conversation() -> Conversation {
        Conversation {
            id: "c1".to_string(),
            title: "Fix the tests".to_string(),
            summary: Some("A short recap".to_string()),
            messages: vec![
                Message {
                    role: Role::User,
                    content: "Why does this fail?".to_string(),
                    id: Some("b1".to_string()),
                    original_type: None,
                    original_source: MessageSource::GlobalBubble,
                },
                Message {
                    role: Role::Assistant,
                    content: "Because of the borrow checker.".to_string(),
                    id: None,
                    original_type: None,
                    original_source: MessageSource::GlobalBubble,
                },
            ],
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            last_updated_at: Utc.with_ymd_and_hms(2024, 5, 2, 11, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_markdown_shape() {
        let mut buf = Vec::new();
        write_conversation_markdown(&mut buf, &conversation()).unwrap();
        let md = String::from_utf8(buf).unwrap();

        assert!(md.starts_with("# Fix the tests\n"));
        assert!(md.contains("Created: "));
        assert!(md.contains("Last Updated: "));
        assert!(md.contains("> A short recap"));
        assert!(md.contains("### User\n\nWhy does this fail?"));
        assert!(md.contains("### Assistant\n\nBecause of the borrow checker."));
        assert_eq!(md.matches("\n---\n").count(), 2);
    }

    #[test]
    fn test_empty_assistant_placeholder() {
        let mut conv = conversation();
        conv.messages = vec![Message {
            role: Role::Assistant,
            content: String::new(),
            id: None,
            original_type: None,
            original_source: MessageSource::LegacyChat,
        }];
        let mut buf = Vec::new();
        write_conversation_markdown(&mut buf, &conv).unwrap();
        let md = String::from_utf8(buf).unwrap();
        assert!(md.contains("*(no response recorded)*"));
    }
}
