// Terminal chat session against the same orchestrator the web UI uses.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::ChatError;
use crate::model::Message;
use crate::orchestrator::{Orchestrator, TurnInput};

const NEW_CHAT_COMMAND: &str = "/nova";
const QUIT_COMMAND: &str = "/sair";

/// Reads one turn per line until EOF or `/sair`. `/nova` starts a new chat.
pub async fn run_chat_session<R, W>(orchestrator: &Orchestrator, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Starting terminal chat session...");
    if let Some(chat) = orchestrator.snapshot().await.active_chat() {
        if let Some(last) = chat.messages.last() {
            output.write_all(render(last).as_bytes()).await?;
        }
    }

    let mut lines = input.lines();
    loop {
        output.write_all(b"> ").await?;
        output.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            QUIT_COMMAND => break,
            NEW_CHAT_COMMAND => {
                orchestrator.new_chat().await;
                output.write_all(render(&Message::seed()).as_bytes()).await?;
                continue;
            }
            _ => {}
        }

        match orchestrator.send_message(TurnInput::text(line)).await {
            Ok(outcome) => {
                let (chat_id, message_id) = (outcome.chat_id.clone(), outcome.message_id);
                // The runtime ends with the session; wait for title and narration.
                outcome.settle().await;
                let state = orchestrator.snapshot().await;
                if let Some(message) = state
                    .chat(&chat_id)
                    .and_then(|c| c.message(message_id))
                {
                    output.write_all(render(message).as_bytes()).await?;
                }
            }
            Err(ChatError::EmptyInput) => debug!("Skipping empty line"),
            Err(e) => {
                output.write_all(format!("! {e}\n").as_bytes()).await?;
            }
        }
    }

    output.flush().await?;
    info!("Chat session finished.");
    Ok(())
}

fn render(message: &Message) -> String {
    let mut out = format!("enhaIA: {}\n", message.content);
    for (label, url) in [
        ("imagem", &message.image_url),
        ("vídeo", &message.video_url),
        ("áudio", &message.audio_url),
    ] {
        if let Some(url) = url {
            out.push_str(&format!("  [{label}] {}\n", shorten(url)));
        }
    }
    out
}

// Data URLs run to megabytes; show only their header.
fn shorten(url: &str) -> &str {
    if url.starts_with("data:") {
        url.split(',').next().unwrap_or(url)
    } else {
        url
    }
}
