use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Decides when the next API call may go out.
#[async_trait]
pub trait Governor: Send {
    /// Suspend until the next call is permitted, then claim that slot.
    async fn ready(&mut self);

    /// Hold off every call until at least `until`.
    fn defer_until(&mut self, until: Instant);
}

/// A fixed pause between consecutive calls. The first call goes out immediately.
pub struct FixedInterval {
    interval: Duration,
    next: Option<Instant>,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }
}

#[async_trait]
impl Governor for FixedInterval {
    async fn ready(&mut self) {
        if let Some(next) = self.next {
            if next > Instant::now() {
                log::debug!("Waiting {:?} before next request", next - Instant::now());
                sleep_until(next).await;
            }
        }
        self.next = Some(Instant::now() + self.interval);
    }

    fn defer_until(&mut self, until: Instant) {
        self.next = Some(match self.next {
            Some(next) if next > until => next,
            _ => until,
        });
    }
}
