//! Terminal output for replayed sessions

use std::io::{self, Write};

use parley_agent::{Return, SessionEvent};
use parley_ai::{Agent, Body, Interaction, Payload, coalesce};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::utils::{first_line, summary_reason_str, truncate_chars};

/// Renders session events, one line per notification (or one JSON object per line)
pub struct Printer<W: Write> {
    out: W,
    json: bool,
    /// Assistant text printed so far from deltas
    streamed: String,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            streamed: String::new(),
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &SessionEvent) -> io::Result<()> {
        if self.json {
            let line = serde_json::to_string(event).map_err(io::Error::other)?;
            return writeln!(self.out, "{}", line);
        }

        match event {
            SessionEvent::RequestStart { .. } => {}
            SessionEvent::Delta { interaction } => {
                if let Some(text) = interaction.text() {
                    let before = self.streamed.len();
                    if coalesce(&mut self.streamed, text) {
                        if before == 0 {
                            write!(self.out, "assistant> ")?;
                        }
                        write!(self.out, "{}", &self.streamed[before..])?;
                        self.out.flush()?;
                    }
                }
            }
            SessionEvent::InteractionCompleted { interaction } => match interaction.agent {
                Agent::Assistant => {
                    if !self.streamed.is_empty() {
                        self.streamed.clear();
                        writeln!(self.out)?;
                    } else {
                        if let Some(reasoning) = interaction.reasoning() {
                            writeln!(
                                self.out,
                                "(thinking: {})",
                                truncate_chars(first_line(reasoning), 80)
                            )?;
                        }
                        writeln!(self.out, "assistant> {}", interaction.text().unwrap_or_default())?;
                    }
                }
                Agent::Error => writeln!(self.out, "error> {}", describe(interaction))?,
                _ => {}
            },
            SessionEvent::ToolCall { interaction } => {
                writeln!(self.out, "[Running {}...]", describe(interaction))?;
            }
            SessionEvent::ToolResult { interaction } => {
                let name = interaction.tool_name().unwrap_or_default();
                let preview = match &interaction.payload {
                    Payload::ToolResult { result, .. } => truncate_chars(&result.to_string(), 200),
                    _ => String::new(),
                };
                if interaction.is_error() {
                    writeln!(self.out, "[{} failed: {}]", name, preview)?;
                } else {
                    writeln!(self.out, "[{}: {}]", name, preview)?;
                }
            }
            SessionEvent::SummarizationStart { reason } => {
                writeln!(self.out, "[Summarizing history ({})]", summary_reason_str(*reason))?;
            }
            SessionEvent::SummarizationEnd {
                tokens_before,
                tokens_after,
            } => {
                writeln!(
                    self.out,
                    "[Summarized: ~{} -> ~{} tokens]",
                    tokens_before, tokens_after
                )?;
            }
            SessionEvent::Error { message, .. } => {
                writeln!(self.out, "Error: {}", message)?;
            }
            SessionEvent::Final {
                success,
                stable,
                turns,
                tool_passes,
                messages,
            } => {
                let status = match (success, stable) {
                    (true, true) => "stable",
                    (true, false) => "finished, not stable",
                    (false, _) => "failed",
                };
                writeln!(
                    self.out,
                    "\n[{} after {} turn(s), {} tool pass(es)]",
                    status, turns, tool_passes
                )?;
                for message in messages {
                    writeln!(self.out, "  - {}", message)?;
                }
            }
        }
        Ok(())
    }
}

/// Print events until the run's final event or until every sender is gone
pub async fn print_events(mut receiver: broadcast::Receiver<SessionEvent>, json: bool) {
    let mut printer = Printer::new(io::stdout(), json);
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let Err(e) = printer.handle(&event) {
                    tracing::warn!("Failed to print event: {}", e);
                    break;
                }
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Printer fell behind; {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One-line description of an interaction
pub fn describe(interaction: &Interaction) -> String {
    match &interaction.payload {
        Payload::Text { content, .. } => truncate_chars(&content.replace('\n', " "), 100),
        Payload::ToolCall {
            name, arguments, ..
        } => format!("{} {}", name, truncate_chars(arguments, 80)),
        Payload::ToolResult {
            name,
            result,
            is_error,
            ..
        } => format!(
            "{} {} {}",
            name,
            if *is_error { "!" } else { "=" },
            truncate_chars(&result.to_string(), 80)
        ),
        Payload::Error { content } => content.clone(),
    }
}

pub fn write_history(out: &mut impl Write, body: &Body, json: bool) -> io::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(&body.to_vec()).map_err(io::Error::other)?;
        return writeln!(out, "{}", text);
    }
    writeln!(out, "\nHistory ({} interactions):", body.len())?;
    for (index, interaction) in body.iter().enumerate() {
        writeln!(
            out,
            "{:>3}  {:<11} {}",
            index,
            interaction.agent.name(),
            describe(interaction)
        )?;
    }
    Ok(())
}

/// Print the final history of a run
pub fn print_history(ret: &Return, json: bool) -> io::Result<()> {
    write_history(&mut io::stdout().lock(), &ret.body, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_agent::{ErrorKind, SummaryReason};
    use serde_json::json;

    fn render(events: &[SessionEvent], json: bool) -> String {
        let mut printer = Printer::new(Vec::new(), json);
        for event in events {
            printer.handle(event).unwrap();
        }
        String::from_utf8(printer.into_inner()).unwrap()
    }

    #[test]
    fn test_streamed_text_printed_once() {
        let events = [
            SessionEvent::Delta {
                interaction: Interaction::assistant("Hel"),
            },
            SessionEvent::Delta {
                interaction: Interaction::assistant("Hello"),
            },
            SessionEvent::Delta {
                interaction: Interaction::assistant("Hello"),
            },
            SessionEvent::InteractionCompleted {
                interaction: Interaction::assistant("Hello"),
            },
        ];
        assert_eq!(render(&events, false), "assistant> Hello\n");
    }

    #[test]
    fn test_tool_round_trip_lines() {
        let call = Interaction::tool_call("c1", "lookup", r#"{"q":"x"}"#);
        let events = [
            SessionEvent::InteractionCompleted {
                interaction: call.clone(),
            },
            SessionEvent::ToolCall { interaction: call },
            SessionEvent::ToolResult {
                interaction: Interaction::tool_result("c1", "lookup", json!({"v": 1}), false),
            },
            SessionEvent::ToolResult {
                interaction: Interaction::tool_result("c2", "other", json!({"success": false}), true),
            },
            SessionEvent::SummarizationStart {
                reason: SummaryReason::Overflow,
            },
            SessionEvent::SummarizationEnd {
                tokens_before: 900,
                tokens_after: 120,
            },
        ];
        let out = render(&events, false);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"[Running lookup {"q":"x"}...]"#,
                r#"[lookup: {"v":1}]"#,
                r#"[other failed: {"success":false}]"#,
                "[Summarizing history (overflow)]",
                "[Summarized: ~900 -> ~120 tokens]",
            ]
        );
    }

    #[test]
    fn test_failure_summary() {
        let events = [
            SessionEvent::Error {
                kind: ErrorKind::Cancelled,
                message: "Cancelled".into(),
            },
            SessionEvent::Final {
                success: false,
                stable: false,
                turns: 1,
                tool_passes: 0,
                messages: vec!["Cancelled".into()],
            },
        ];
        let out = render(&events, false);
        assert!(out.starts_with("Error: Cancelled\n"));
        assert!(out.contains("[failed after 1 turn(s), 0 tool pass(es)]"));
        assert!(out.ends_with("  - Cancelled\n"));
    }

    #[test]
    fn test_json_lines() {
        let events = [
            SessionEvent::SummarizationStart {
                reason: SummaryReason::Manual,
            },
            SessionEvent::Final {
                success: true,
                stable: true,
                turns: 1,
                tool_passes: 0,
                messages: vec![],
            },
        ];
        let out = render(&events, true);
        let parsed: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["type"], "summarization_start");
        assert_eq!(parsed[1]["type"], "final");
    }

    #[test]
    fn test_history_listing() {
        let body = Body::from_interactions([
            Interaction::system("Be brief."),
            Interaction::user("hi\nthere"),
            Interaction::error("boom"),
        ]);
        let mut out = Vec::new();
        write_history(&mut out, &body, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("History (3 interactions):"));
        assert!(text.contains("  1  user        hi there"));
        assert!(text.contains("  2  error       boom"));
    }
}
