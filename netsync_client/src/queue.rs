//! Admission queue tracking.
//!
//! A full server parks new players in a queue and reports their position.
//! Position 0 means admitted.

use netsync_shared::net::{QueueUpdateMsg, WaitEstimate};

/// Seconds of wait assumed per queued player ahead of us.
pub const SECONDS_PER_POSITION: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    pub position: u32,
    pub estimated_wait: String,
}

impl QueueState {
    pub fn is_admitted(&self) -> bool {
        self.position == 0
    }
}

/// What a queue message means for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSignal {
    /// Still (or newly) waiting.
    Waiting(QueueState),
    /// Left the queue. Fires once per transition.
    Ready,
    /// Admission notice while not waiting; nothing to do.
    Ignored,
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Option<QueueState>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, msg: &QueueUpdateMsg) -> QueueSignal {
        if msg.position == 0 {
            let was_waiting = self.is_waiting();
            self.state = Some(QueueState {
                position: 0,
                estimated_wait: String::new(),
            });
            return if was_waiting {
                QueueSignal::Ready
            } else {
                QueueSignal::Ignored
            };
        }

        let estimated_wait = match &msg.estimated_wait_time {
            Some(WaitEstimate::Label(label)) => label.clone(),
            Some(WaitEstimate::Seconds(secs)) => format_wait(*secs),
            None => estimate_wait(msg.position),
        };
        let state = QueueState {
            position: msg.position,
            estimated_wait,
        };
        self.state = Some(state.clone());
        QueueSignal::Waiting(state)
    }

    pub fn is_waiting(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_admitted())
    }

    pub fn state(&self) -> Option<&QueueState> {
        self.state.as_ref()
    }

    pub fn reset(&mut self) {
        self.state = None;
    }
}

/// Wait label derived from queue position alone.
pub fn estimate_wait(position: u32) -> String {
    format_wait(u64::from(position) * SECONDS_PER_POSITION)
}

/// `"< 1 minute"` under a minute, otherwise `"~N minutes"` rounded up.
pub fn format_wait(seconds: u64) -> String {
    if seconds < 60 {
        "< 1 minute".to_string()
    } else {
        format!("~{} minutes", seconds.div_ceil(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(position: u32) -> QueueUpdateMsg {
        QueueUpdateMsg {
            position,
            estimated_wait_time: None,
        }
    }

    #[test]
    fn wait_buckets() {
        assert_eq!(estimate_wait(1), "< 1 minute");
        assert_eq!(estimate_wait(2), "~1 minutes");
        assert_eq!(estimate_wait(3), "~2 minutes");
        assert_eq!(estimate_wait(10), "~5 minutes");
        assert_eq!(format_wait(59), "< 1 minute");
        assert_eq!(format_wait(61), "~2 minutes");
    }

    #[test]
    fn positive_position_waits_with_estimate() {
        let mut q = AdmissionQueue::new();
        let signal = q.apply(&update(3));
        assert_eq!(
            signal,
            QueueSignal::Waiting(QueueState {
                position: 3,
                estimated_wait: "~2 minutes".into()
            })
        );
        assert!(q.is_waiting());
    }

    #[test]
    fn server_estimate_wins() {
        let mut q = AdmissionQueue::new();
        let label = q.apply(&QueueUpdateMsg {
            position: 4,
            estimated_wait_time: Some(WaitEstimate::Label("soon".into())),
        });
        assert!(matches!(label, QueueSignal::Waiting(s) if s.estimated_wait == "soon"));
        let secs = q.apply(&QueueUpdateMsg {
            position: 4,
            estimated_wait_time: Some(WaitEstimate::Seconds(200)),
        });
        assert!(matches!(secs, QueueSignal::Waiting(s) if s.estimated_wait == "~4 minutes"));
    }

    #[test]
    fn ready_fires_once_per_transition() {
        let mut q = AdmissionQueue::new();
        q.apply(&update(2));
        assert_eq!(q.apply(&update(0)), QueueSignal::Ready);
        assert_eq!(q.apply(&update(0)), QueueSignal::Ignored);
        assert!(!q.is_waiting());

        q.apply(&update(1));
        assert_eq!(q.apply(&update(0)), QueueSignal::Ready);
    }

    #[test]
    fn admission_without_queueing_is_ignored() {
        let mut q = AdmissionQueue::new();
        assert_eq!(q.apply(&update(0)), QueueSignal::Ignored);
    }
}
