use std::time::Duration;

use parking_lot::Mutex;

/// Cross-thread wakeup for a thread sleeping until its next deadline.
///
/// A notification sent while nobody is waiting is remembered, and the next wait returns
/// immediately.
pub struct Notify {
    poller: polling::Poller,
    events: Mutex<polling::Events>,
}

impl Notify {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poller: polling::Poller::new()?,
            events: Mutex::new(polling::Events::new()),
        })
    }

    /// Wakes the current or next call to `wait`.
    pub fn notify(&self) {
        let _ = self.poller.notify();
    }

    /// Blocks until notified or until `timeout` elapses. A timeout of `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        let mut events = self.events.lock();
        events.clear();

        self.poller.wait(&mut events, timeout)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn timeout() {
        let notify = Notify::new().unwrap();

        let start = Instant::now();
        notify.wait(Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn pending_notification() {
        let notify = Notify::new().unwrap();
        notify.notify();

        let start = Instant::now();
        notify.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cross_thread() {
        let notify = Arc::new(Notify::new().unwrap());
        let notify_thread = Arc::clone(&notify);

        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notify_thread.notify();
        });

        notify.wait(None).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        handle.join().unwrap();
    }
}
