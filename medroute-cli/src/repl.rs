//! Single-question mode and the interactive REPL.

use medroute_core::AnswerPipeline;
use medroute_core::types::{AttachmentKind, PipelineOutcome, Query};
use std::io::{self, BufRead, Write};

/// Answer one question and exit.
pub async fn run_single_question(
    pipeline: &AnswerPipeline,
    question: &str,
    user: &str,
    json: bool,
) -> anyhow::Result<()> {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let outcome = pipeline
        .answer(Query::new(question, user, conversation_id))
        .await;
    print_outcome(&outcome, json)
}

/// Read questions from stdin until EOF or `/quit`.
pub async fn run_interactive(
    pipeline: &AnswerPipeline,
    user: &str,
    json: bool,
) -> anyhow::Result<()> {
    println!("MedRoute interactive mode. Type /help for commands, /quit to exit.");
    let mut conversation_id = uuid::Uuid::new_v4().to_string();
    let mut attachment: Option<(String, AttachmentKind)> = None;

    let stdin = io::stdin();
    loop {
        print!("\x1b[1;34m> \x1b[0m");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input).is_err() || input.is_empty() {
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            let parts: Vec<&str> = input.splitn(2, ' ').collect();
            let cmd = parts[0];
            let arg = parts.get(1).copied().unwrap_or("").trim();

            match cmd {
                "/quit" | "/exit" | "/q" => {
                    println!("Goodbye!");
                    break;
                }
                "/help" | "/?" => {
                    println!("{}", HELP_TEXT);
                }
                "/new" => {
                    conversation_id = uuid::Uuid::new_v4().to_string();
                    attachment = None;
                    println!("Started a new conversation.");
                }
                "/attach" => match parse_attachment(arg) {
                    Some(parsed) => {
                        println!("Attached {} for the next question.", parsed.0);
                        attachment = Some(parsed);
                    }
                    None => println!("Usage: /attach <document|image> <id>"),
                },
                "/stats" => print_stats(pipeline)?,
                "/audit" => {
                    let log = pipeline.safety().audit_log();
                    let start = log.len().saturating_sub(10);
                    for entry in &log[start..] {
                        println!("{}", serde_json::to_string(entry)?);
                    }
                }
                "/cache" => {
                    if arg == "clear" {
                        println!("Cleared {} cached answers.", pipeline.cache().clear());
                    } else {
                        let metrics = pipeline.cache().metrics();
                        println!(
                            "Cache: {} entries, {} hits, {} misses ({:.0}% hit rate)",
                            metrics.entries,
                            metrics.hits,
                            metrics.misses,
                            metrics.hit_rate() * 100.0
                        );
                    }
                }
                _ => println!("Unknown command: {}. Type /help for commands.", cmd),
            }
            continue;
        }

        let mut query = Query::new(input, user, conversation_id.as_str());
        if let Some((document_id, kind)) = attachment.take() {
            query = query.with_attachment(document_id, kind);
        }
        let outcome = pipeline.answer(query).await;
        print_outcome(&outcome, json)?;
    }
    Ok(())
}

const HELP_TEXT: &str = "Commands:
  /attach <document|image> <id>  Attach an uploaded file to the next question
  /new                           Start a new conversation
  /stats                         Show pipeline statistics
  /audit                         Show the latest safety audit entries
  /cache [clear]                 Show or clear the response cache
  /quit                          Exit";

fn parse_attachment(arg: &str) -> Option<(String, AttachmentKind)> {
    let mut parts = arg.split_whitespace();
    let kind = match parts.next()? {
        "document" | "doc" => AttachmentKind::Document,
        "image" | "img" => AttachmentKind::Image,
        _ => return None,
    };
    let id = parts.next()?;
    Some((id.to_string(), kind))
}

fn print_stats(pipeline: &AnswerPipeline) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    println!(
        "{}",
        serde_json::to_string_pretty(&pipeline.orchestrator().stats())?
    );
    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!("\n{}\n", outcome.text());
    if let PipelineOutcome::Delivered { answer, from_cache } = outcome {
        if !answer.citations.is_empty() {
            println!("Sources: {}", answer.citations.join(", "));
        }
        if *from_cache {
            println!("(cached answer)");
        }
        if answer.metadata.retrieval_degraded {
            println!("(knowledge base unavailable; answer is not grounded)");
        }
    }
    Ok(())
}
