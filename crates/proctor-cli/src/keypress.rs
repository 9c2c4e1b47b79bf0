use std::io::{BufRead, IsTerminal};

use tokio::sync::mpsc;

/// Watch an interactive stdin for the quit key (`q` then Enter).
///
/// Returns a receiver that yields once when quit is requested. When stdin is
/// not a terminal, or is already carrying frames, no watcher runs and the
/// receiver is closed immediately.
pub fn watch_quit(enabled: bool) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    if !enabled || !std::io::stdin().is_terminal() {
        return rx;
    }

    // Detached: a blocked stdin read must not hold up process exit.
    let spawned = std::thread::Builder::new()
        .name("proctor-keypress".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if is_quit(&line) {
                    let _ = tx.send(());
                    break;
                }
            }
        });
    match spawned {
        Ok(_) => tracing::info!("press q + Enter to end the session"),
        Err(e) => tracing::warn!(error = %e, "quit key watcher unavailable"),
    }
    rx
}

fn is_quit(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("q")
}
