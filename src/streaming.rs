use std::io::{self, Write};

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::app::AppContext;
use crate::error::TurnError;
use crate::orchestrator::{Orchestrator, TurnOutcome, TurnRequest};

pub const NO_TEXTUAL_RESPONSE: &str = "No textual response produced by the orchestrator.";

/// Writes each delta as it arrives and returns everything written.
pub async fn render_deltas<W: Write>(
    mut deltas: UnboundedReceiver<String>,
    out: &mut W,
) -> io::Result<String> {
    let mut rendered = String::new();
    while let Some(delta) = deltas.recv().await {
        out.write_all(delta.as_bytes())?;
        out.flush()?;
        rendered.push_str(&delta);
    }
    Ok(rendered)
}

/// Runs a turn while rendering its text incrementally to `out`.
pub async fn run_turn_streaming<W: Write>(
    orchestrator: &Orchestrator,
    request: TurnRequest<'_>,
    out: &mut W,
) -> Result<TurnOutcome, TurnError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (turn, rendered) = tokio::join!(
        orchestrator.run_turn(request, Some(tx)),
        render_deltas(rx, out)
    );

    let rendered = match rendered {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to render streamed response");
            String::new()
        }
    };
    let outcome = turn?;

    let finished = if rendered.trim().is_empty() {
        writeln!(out, "{NO_TEXTUAL_RESPONSE}")
    } else {
        writeln!(out)
    };
    if let Err(err) = finished {
        tracing::warn!(error = %err, "Failed to finish streamed response");
    }
    Ok(outcome)
}

/// One-shot turn with no prior history, streamed to stdout.
pub async fn run_ask(app: &AppContext, prompt: &str) -> anyhow::Result<TurnOutcome> {
    let mut stdout = io::stdout();
    let mut outcome = run_turn_streaming(
        &app.orchestrator,
        TurnRequest {
            user_id: &app.cfg.user_id,
            query: prompt,
            history: &[],
        },
        &mut stdout,
    )
    .await?;
    app.orchestrator
        .commit_turn(&app.cfg.user_id, prompt, &mut outcome)
        .await;
    tracing::info!(
        tool_calls = outcome.tool_calls.len(),
        memories = outcome.memories.len(),
        "Ask completed"
    );
    Ok(outcome)
}
