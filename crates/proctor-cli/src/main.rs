use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use proctor_core::{ProctorEvent, ScoringPolicy, Signal};
use proctor_link::{Emitter, PollingTransport};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod keypress;
mod replay;
mod session;

use cli::Cli;
use config::Config;
use replay::{ReplayFaces, ReplayObjects, ReplaySource};
use session::{spawn_session, Session, SessionError, SessionOutcome, StopReason};

/// How long the session thread may take to finish its current frame once
/// stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Pause between the test event and disconnecting in `--test` mode.
const TEST_LINGER: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    tracing::info!(
        session_id = %config.session_id,
        server = %config.server_url,
        namespace = %config.namespace,
        threshold = config.policy.threshold,
        "proctor starting"
    );

    // Connecting blocks on HTTP; a failure here is fatal.
    let transport =
        PollingTransport::new(&config.server_url, &config.namespace, config.request_timeout);
    let reconnect = config.reconnect.clone();
    let mut emitter = tokio::task::spawn_blocking(move || Emitter::connect(transport, reconnect))
        .await?
        .context("failed to connect to proctor server")?;

    if cli.test {
        let session_id = config.session_id.clone();
        tokio::task::spawn_blocking(move || {
            emitter.emit(ProctorEvent::new(&session_id, &Signal::TestConnection));
            std::thread::sleep(TEST_LINGER);
            emitter.close();
        })
        .await?;
        tracing::info!("test connection complete");
        return Ok(());
    }

    let source = ReplaySource::open(&config.frames, config.frame_interval)
        .context("failed to open frame source")?;
    let session = Session::new(
        config.session_id.clone(),
        ScoringPolicy::new(config.policy.clone()),
        Box::new(source),
        Box::new(ReplayFaces),
        Box::new(ReplayObjects),
        Box::new(emitter),
    );
    let mut handle = spawn_session(session)?;
    let mut quit = keypress::watch_quit(!config.frames.is_stdin());

    let reason = tokio::select! {
        result = handle.wait() => return report(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            StopReason::Interrupt
        }
        Some(()) = quit.recv() => {
            tracing::info!("quit requested, shutting down");
            StopReason::Quit
        }
    };

    // Closes the link and releases the frame source immediately, even if the
    // session thread is blocked in a read or a reconnect backoff.
    handle.request_stop(reason);
    match tokio::time::timeout(SHUTDOWN_GRACE, handle.wait()).await {
        Ok(result) => report(result),
        Err(_) => {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "session thread did not finish in time — link already closed, exiting"
            );
            Ok(())
        }
    }
}

/// Log how the session ended. Threshold, end-of-stream, quit and interrupt
/// all exit 0; only failures propagate.
fn report(result: Result<SessionOutcome, SessionError>) -> Result<()> {
    let outcome = result.context("proctoring session failed")?;
    tracing::info!(
        reason = ?outcome.reason,
        score = outcome.summary.score,
        threshold = outcome.summary.threshold,
        warnings = ?outcome.summary.warnings,
        frames = outcome.frames,
        "session finished"
    );
    Ok(())
}
