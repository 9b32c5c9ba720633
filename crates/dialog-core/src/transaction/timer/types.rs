//! Timer identities and durations for transactions and dialogs

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialog::DialogId;
use crate::transaction::TransactionKey;

/// Transaction timers of RFC 3261 §17 and RFC 6026
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerType {
    /// **Timer A (ICT): INVITE retransmission.**
    /// Starts at T1 and doubles on each firing, unreliable transports only.
    A,
    /// **Timer B (ICT): INVITE transaction timeout**, 64*T1 while Calling.
    B,
    /// **Timer D (ICT): wait for response retransmissions** in Completed.
    /// 32 s on unreliable transports, zero otherwise.
    D,
    /// **Timer E (NICT): request retransmission.**
    /// T1 doubling up to T2 in Trying, T2 in Proceeding.
    E,
    /// **Timer F (NICT): non-INVITE transaction timeout**, 64*T1.
    F,
    /// **Timer G (IST): non-2xx final response retransmission**, T1 doubling up to T2.
    G,
    /// **Timer H (IST): wait for ACK** in Completed, 64*T1.
    H,
    /// **Timer I (IST): absorb ACK retransmissions** in Confirmed, T4 or zero.
    I,
    /// **Timer J (NIST): absorb request retransmissions** in Completed, 64*T1 or zero.
    J,
    /// **Timer K (NICT): absorb response retransmissions** in Completed, T4 or zero.
    K,
    /// **Timer L (IST): wait in Accepted** for retransmitted INVITEs, 64*T1.
    L,
    /// **Timer M (ICT): wait in Accepted** for forked or retransmitted 2xx, 64*T1.
    M,
    /// IST: send 100 Trying if the TU has not answered within 200 ms
    Trying,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timers owned by dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogTimer {
    /// UAS: re-send the 2xx to an INVITE until the ACK arrives (T1 doubling to T2)
    Retransmit2xx,
    /// UAS: give up waiting for the ACK after 64*T1
    AckTimeout,
    /// UAS: re-send an unacknowledged reliable provisional (T1 doubling)
    RetransmitReliable1xx,
    /// UAS: no PRACK within 64*T1
    Reliable1xxTimeout,
    /// Subscriber: send a refreshing SUBSCRIBE
    Refresh,
    /// Subscription expiry
    Expiration,
    /// Subscriber: no NOTIFY within 64*T1 of the 2xx (RFC 6665 Timer N)
    TimerN,
}

impl fmt::Display for DialogTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a timer fires into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerTarget {
    Transaction(TransactionKey, TimerType),
    Dialog(DialogId, DialogTimer),
}

impl fmt::Display for TimerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerTarget::Transaction(key, timer) => write!(f, "Timer {} for {}", timer, key),
            TimerTarget::Dialog(id, timer) => write!(f, "{} for dialog {}", timer, id),
        }
    }
}

/// RFC 3261 base timer values.
///
/// Every other duration is derived from these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// **T1: RTT estimate (default 500 ms).** Initial retransmission interval.
    pub t1: Duration,

    /// **T2: maximum retransmission interval (default 4 s)**
    pub t2: Duration,

    /// **T4: maximum time a message remains in the network (default 5 s)**
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Delay before an IST sends 100 Trying on its own
pub const TRYING_DELAY: Duration = Duration::from_millis(200);

impl TimerSettings {
    /// 64*T1, used by Timers B, F, H, J, L, M and N
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Next retransmission interval: doubled, capped at T2
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }

    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            Duration::from_secs(32).max(self.transaction_timeout())
        }
    }

    pub fn timer_i(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.t4 }
    }

    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.transaction_timeout() }
    }

    pub fn timer_k(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.t4 }
    }

    /// Rejects settings the retransmission arithmetic cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.t1.is_zero() {
            return Err("T1 must be greater than zero".into());
        }
        if self.t2 < self.t1 {
            return Err(format!("T2 ({:?}) must not be below T1 ({:?})", self.t2, self.t1));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = TimerSettings::default();
        assert_eq!(settings.t1, Duration::from_millis(500));
        assert_eq!(settings.transaction_timeout(), Duration::from_secs(32));
        assert_eq!(settings.timer_d(false), Duration::from_secs(32));
        assert_eq!(settings.timer_d(true), Duration::ZERO);
        assert_eq!(settings.timer_k(false), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_caps_at_t2() {
        let settings = TimerSettings::default();
        let mut interval = settings.t1;
        let mut seen = Vec::new();
        for _ in 0..5 {
            interval = settings.backoff(interval);
            seen.push(interval.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn test_validate() {
        let mut settings = TimerSettings::default();
        assert!(settings.validate().is_ok());
        settings.t2 = Duration::from_millis(100);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_from_json() {
        let settings: TimerSettings =
            serde_json::from_str(r#"{"t1":{"secs":0,"nanos":100000000},"t2":{"secs":1,"nanos":0},"t4":{"secs":2,"nanos":0}}"#)
                .unwrap();
        assert_eq!(settings.t1, Duration::from_millis(100));
        assert_eq!(settings.transaction_timeout(), Duration::from_millis(6400));
    }
}
