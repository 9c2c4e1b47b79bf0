use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use proctor_core::{EventSink, ProctorEvent, ReleaseHandle, PROCTOR_EVENT};

use crate::error::LinkError;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{PollingTransport, Transport};

/// Fire-and-forget sender of proctor events.
///
/// Owns one persistent [`Transport`]. Delivery failures are logged and the
/// event is dropped; nothing is queued for later. When the link is found
/// down the emitter reconnects according to its [`ReconnectPolicy`],
/// blocking the caller for the backoff. If every attempt fails the emitter
/// gives up and drops all further events until closed.
///
/// [`Emitter::close_handle`] shuts the emitter down from another thread,
/// cutting short any backoff in progress.
pub struct Emitter<T: Transport = PollingTransport> {
    transport: T,
    policy: ReconnectPolicy,
    shutdown: Arc<ShutdownLatch>,
    closed: bool,
    gave_up: bool,
    sent: u64,
    dropped: u64,
}

impl<T: Transport> Emitter<T> {
    /// Open the transport. Failure here is fatal to the caller.
    pub fn connect(mut transport: T, policy: ReconnectPolicy) -> Result<Self, LinkError> {
        transport.open()?;
        Ok(Self {
            transport,
            policy,
            shutdown: Arc::new(ShutdownLatch::default()),
            closed: false,
            gave_up: false,
            sent: 0,
            dropped: 0,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Events handed to the transport without error.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Events discarded because the link was down or the send failed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Handle that closes the link from another thread. Events emitted after
    /// it fires are dropped and no reconnect is attempted.
    pub fn close_handle(&self) -> ReleaseHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let transport = self.transport.close_handle();
        ReleaseHandle::new(move || {
            shutdown.trigger();
            transport.release();
        })
    }

    pub fn emit(&mut self, event: ProctorEvent) {
        if self.closed || self.shutdown.is_set() {
            tracing::debug!(kind = event.kind(), "emitter closed — event dropped");
            self.dropped += 1;
            return;
        }

        if !self.transport.is_open() && !self.reconnect() {
            tracing::warn!(kind = event.kind(), "link down — event dropped");
            self.dropped += 1;
            return;
        }

        let kind = event.kind();
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(kind, error = %e, "event serialization failed");
                self.dropped += 1;
                return;
            }
        };

        match self.transport.emit(PROCTOR_EVENT, payload) {
            Ok(()) => {
                self.sent += 1;
                tracing::info!(kind, meta = %event.meta(), "emitted proctor event");
            }
            Err(e) => {
                self.dropped += 1;
                tracing::warn!(kind, error = %e, "emit failed — event dropped");
                self.reconnect();
            }
        }
    }

    /// Re-open the transport per the policy. Returns whether the link is up.
    fn reconnect(&mut self) -> bool {
        if self.gave_up {
            return false;
        }

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            tracing::info!(
                attempt = attempt + 1,
                max = self.policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting to proctor server"
            );
            if self.shutdown.wait(delay) {
                tracing::info!("shutdown requested — reconnect abandoned");
                return false;
            }

            match self.transport.open() {
                Ok(()) => {
                    tracing::info!(attempt = attempt + 1, "reconnected to proctor server");
                    return true;
                }
                Err(e) => tracing::warn!(attempt = attempt + 1, error = %e, "reconnect failed"),
            }
        }

        tracing::error!(
            attempts = self.policy.max_attempts,
            "giving up on proctor server — further events will be dropped"
        );
        self.gave_up = true;
        false
    }

    /// Close the link once; later calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.transport.close();
        tracing::info!(sent = self.sent, dropped = self.dropped, "emitter closed");
    }
}

impl<T: Transport> EventSink for Emitter<T> {
    fn emit(&mut self, event: ProctorEvent) {
        Emitter::emit(self, event);
    }

    fn close(&mut self) {
        Emitter::close(self);
    }

    fn close_handle(&self) -> Option<ReleaseHandle> {
        Some(Emitter::close_handle(self))
    }
}

/// Set-once flag that a reconnect backoff sleeps on.
#[derive(Default)]
struct ShutdownLatch {
    set: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownLatch {
    fn trigger(&self) {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless triggered first. Returns whether it was.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl<T: Transport> Drop for Emitter<T> {
    fn drop(&mut self) {
        self.close();
    }
}
