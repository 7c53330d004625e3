use crate::types::{InstanceId, TokenId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// What a due entry means for the waiting token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// An intermediate timer event elapsed
    Timer,
    /// A user or receive task waited past its `timeout_ms`
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry {
    pub deadline: DateTime<Utc>,
    pub instance_id: InstanceId,
    pub token_id: TokenId,
    pub kind: TimerKind,
}

#[derive(Default)]
struct TimerInner {
    by_deadline: BTreeMap<(DateTime<Utc>, InstanceId, TokenId), TimerKind>,
    by_token: HashMap<(InstanceId, TokenId), DateTime<Utc>>,
}

impl TimerInner {
    fn remove_token(&mut self, instance_id: InstanceId, token_id: TokenId) -> bool {
        match self.by_token.remove(&(instance_id, token_id)) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, instance_id, token_id));
                true
            }
            None => false,
        }
    }
}

/// Deadline-ordered index of pending timers, at most one per token
#[derive(Default)]
pub struct TimerIndex {
    inner: Mutex<TimerInner>,
    notify: Notify,
}

impl TimerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm (or re-arm) the timer of a token
    pub fn schedule(
        &self,
        deadline: DateTime<Utc>,
        instance_id: InstanceId,
        token_id: TokenId,
        kind: TimerKind,
    ) {
        {
            let mut inner = self.lock();
            inner.remove_token(instance_id, token_id);
            inner
                .by_deadline
                .insert((deadline, instance_id, token_id), kind);
            inner.by_token.insert((instance_id, token_id), deadline);
        }
        self.notify.notify_one();
    }

    pub fn cancel_token(&self, instance_id: InstanceId, token_id: TokenId) -> bool {
        self.lock().remove_token(instance_id, token_id)
    }

    pub fn cancel_instance(&self, instance_id: InstanceId) -> usize {
        let mut inner = self.lock();
        let tokens: Vec<TokenId> = inner
            .by_token
            .keys()
            .filter(|(id, _)| *id == instance_id)
            .map(|(_, token)| *token)
            .collect();
        for token in &tokens {
            inner.remove_token(instance_id, *token);
        }
        tokens.len()
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<TimerEntry> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut due = Vec::new();
        while let Some((&(deadline, instance_id, token_id), &kind)) = inner.by_deadline.first_key_value() {
            if deadline > now {
                break;
            }
            inner.remove_token(instance_id, token_id);
            due.push(TimerEntry {
                deadline,
                instance_id,
                token_id,
                kind,
            });
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().by_deadline.keys().next().map(|(deadline, _, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes after the next `schedule` call
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_take_due_in_deadline_order() {
        let timers = TimerIndex::new();
        let now = Utc::now();
        let instance = InstanceId::new();
        let (early, late, future) = (TokenId::new(), TokenId::new(), TokenId::new());

        timers.schedule(now - Duration::seconds(1), instance, late, TimerKind::Timeout);
        timers.schedule(now - Duration::seconds(5), instance, early, TimerKind::Timer);
        timers.schedule(now + Duration::seconds(60), instance, future, TimerKind::Timer);

        let due = timers.take_due(now);
        let tokens: Vec<TokenId> = due.iter().map(|e| e.token_id).collect();
        assert_eq!(tokens, vec![early, late]);
        assert_eq!(due[1].kind, TimerKind::Timeout);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_reschedule_and_cancel() {
        let timers = TimerIndex::new();
        let now = Utc::now();
        let a = InstanceId::new();
        let b = InstanceId::new();
        let token = TokenId::new();

        timers.schedule(now, a, token, TimerKind::Timer);
        timers.schedule(now + Duration::seconds(30), a, token, TimerKind::Timer);
        assert_eq!(timers.len(), 1);
        assert!(timers.take_due(now).is_empty());

        timers.schedule(now, b, TokenId::new(), TimerKind::Timer);
        timers.schedule(now, b, TokenId::new(), TimerKind::Timeout);
        assert_eq!(timers.cancel_instance(b), 2);
        assert!(timers.cancel_token(a, token));
        assert!(!timers.cancel_token(a, token));
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
