use tokio::time::{Duration, Instant};

/// What the owning session should do once the armed deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Send these bytes again, unchanged.
    Retransmit(Vec<u8>),
    /// Nothing to resend; the deadline only guards liveness.
    Idle,
    /// Retry budget spent.
    Exhausted,
}

/// Stop-and-wait retransmission controller: one deadline, one packet.
#[derive(Debug)]
pub struct RetransmissionTimer {
    timeout: Duration,
    max_retries: u8,
    retries: u8,
    deadline: Option<Instant>,
    packet: Option<Vec<u8>>,
}

impl RetransmissionTimer {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        Self {
            timeout,
            max_retries,
            retries: 0,
            deadline: None,
            packet: None,
        }
    }

    /// Starts a fresh cycle. `packet` is what gets resent on expiry.
    pub fn arm(&mut self, packet: Option<Vec<u8>>) {
        self.packet = packet;
        self.retries = 0;
        self.deadline = Some(Instant::now() + self.timeout);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.packet = None;
        self.retries = 0;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_due(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Consumes the current deadline. A disarmed timer never expires, so each
    /// deadline yields at most one notification.
    pub fn expire(&mut self) -> Option<Expiry> {
        self.deadline.take()?;
        if self.retries >= self.max_retries {
            self.packet = None;
            return Some(Expiry::Exhausted);
        }
        self.retries += 1;
        self.deadline = Some(Instant::now() + self.timeout);
        Some(match &self.packet {
            Some(packet) => Expiry::Retransmit(packet.clone()),
            None => Expiry::Idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_timeout() {
        let mut timer = RetransmissionTimer::new(Duration::from_millis(500), 3);
        assert!(!timer.is_armed());
        timer.arm(Some(vec![0, 4, 0, 1]));
        assert!(!timer.is_due());
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!timer.is_due());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(timer.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn resends_same_packet_until_exhausted() {
        let packet = vec![0, 3, 0, 1, 42];
        let mut timer = RetransmissionTimer::new(Duration::from_millis(100), 2);
        timer.arm(Some(packet.clone()));

        for attempt in 1..=2 {
            tokio::time::advance(Duration::from_millis(100)).await;
            assert_eq!(timer.expire(), Some(Expiry::Retransmit(packet.clone())));
            assert_eq!(timer.retries(), attempt);
            assert!(!timer.is_due());
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(timer.expire(), Some(Expiry::Exhausted));
        assert!(!timer.is_armed());
        assert_eq!(timer.expire(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_expiry() {
        let mut timer = RetransmissionTimer::new(Duration::from_millis(100), 3);
        timer.arm(None);
        timer.cancel();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!timer.is_due());
        assert_eq!(timer.expire(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_resets_retry_budget() {
        let mut timer = RetransmissionTimer::new(Duration::from_millis(100), 1);
        timer.arm(None);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(timer.expire(), Some(Expiry::Idle));
        timer.arm(None);
        assert_eq!(timer.retries(), 0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(timer.expire(), Some(Expiry::Idle));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(timer.expire(), Some(Expiry::Exhausted));
    }
}
