//! Background threads driving a session.
//!
//! The timer thread sleeps until the session's next deadline and runs `dispatch`. Anything that may
//! arm an earlier timer wakes it through the session's notifier. An optional receive thread feeds
//! datagrams from a UDP socket into the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::session::Session;
use crate::socket::UdpReceiver;

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Coordinator {
    session: Arc<Session>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

fn run_timers(session: &Session, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        session.dispatch(session.now());

        let timeout = session
            .next_deadline()
            .map(|deadline| Duration::from_micros(deadline.saturating_sub(session.now())));

        if let Err(err) = session.notify().wait(timeout) {
            warn!(%err, "timer wait failed");
            break;
        }
    }
}

fn run_receiver(session: &Session, receiver: &mut UdpReceiver, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match receiver.wait_for_datagram(Some(RECEIVE_POLL_INTERVAL)) {
            Ok(Some(bytes)) => {
                session.handle_packet(bytes, session.now());

                // Process any further datagrams without blocking
                while let Ok(Some(bytes)) = receiver.try_read_datagram() {
                    session.handle_packet(bytes, session.now());
                }
            }
            Ok(None) => (),
            Err(err) => {
                warn!(%err, "receive failed");
                break;
            }
        }
    }
}

impl Coordinator {
    /// Starts a timer thread for `session`. Inbound datagrams must be handed to the session by the
    /// caller.
    pub fn spawn(session: Arc<Session>) -> std::io::Result<Self> {
        let mut coordinator = Self {
            session,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };

        coordinator.spawn_timers()?;

        info!(tsi = %coordinator.session.tsi(), "coordinator started");

        Ok(coordinator)
    }

    /// Starts a timer thread for `session`, and a receive thread reading from `receiver`.
    pub fn spawn_with_receiver(
        session: Arc<Session>,
        mut receiver: UdpReceiver,
    ) -> std::io::Result<Self> {
        let mut coordinator = Self::spawn(session)?;

        let session = Arc::clone(&coordinator.session);
        let shutdown = Arc::clone(&coordinator.shutdown);

        let handle = thread::Builder::new()
            .name("pgm-receive".into())
            .spawn(move || run_receiver(&session, &mut receiver, &shutdown))?;

        coordinator.threads.push(handle);

        Ok(coordinator)
    }

    fn spawn_timers(&mut self) -> std::io::Result<()> {
        let session = Arc::clone(&self.session);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new()
            .name("pgm-timer".into())
            .spawn(move || run_timers(&session, &shutdown))?;

        self.threads.push(handle);

        Ok(())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Stops and joins every thread.
    pub fn shutdown(self) {}
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.session.notify().notify();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        info!(tsi = %self.session.tsi(), "coordinator stopped");
    }
}
