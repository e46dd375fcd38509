//! Terminal confirmation prompts and live output rendering.

use std::io::Write;

use keel_engine::ConfirmationRequest;
use keel_types::{ConfirmationOutcome, ShellOutputEvent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

/// Reads y/a/n answers line by line. End of input or an abort cancels.
pub struct Prompter<R> {
    lines: Lines<R>,
}

impl Prompter<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> Prompter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    pub async fn ask(
        &mut self,
        request: &ConfirmationRequest,
        cancel: &CancellationToken,
    ) -> ConfirmationOutcome {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "\n{}", request.summary);
        let _ = writeln!(err, "  {}", request.reason);
        let always = if request.allowlist_entries.is_empty() {
            String::new()
        } else {
            format!(", [a]lways allow {}", request.allowlist_entries.join(", "))
        };
        let _ = write!(err, "Proceed? [y]es{always}, [n]o: ");
        let _ = err.flush();
        drop(err);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    eprintln!();
                    return ConfirmationOutcome::Cancel;
                }
                next = self.lines.next_line() => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    eprintln!();
                    return ConfirmationOutcome::Cancel;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read confirmation");
                    return ConfirmationOutcome::Cancel;
                }
            };
            if let Some(outcome) = parse_answer(&line, !request.allowlist_entries.is_empty()) {
                return outcome;
            }
            eprint!("Please answer y, a, or n: ");
        }
    }
}

fn parse_answer(line: &str, always_offered: bool) -> Option<ConfirmationOutcome> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ConfirmationOutcome::ProceedOnce),
        "a" | "always" if always_offered => Some(ConfirmationOutcome::ProceedAlways),
        "n" | "no" | "" => Some(ConfirmationOutcome::Cancel),
        _ => None,
    }
}

/// Echo streamed plain-backend output as it arrives.
pub fn print_output_event(event: &ShellOutputEvent) {
    match event {
        ShellOutputEvent::Data { chunk } => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(chunk.as_bytes());
            let _ = out.flush();
        }
        ShellOutputEvent::BinaryDetected => eprintln!("keel: binary output detected"),
        ShellOutputEvent::BinaryProgress { .. } => {}
    }
}
