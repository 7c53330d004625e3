use crate::types::{InstanceId, TokenId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct QueueInner {
    /// Instances with pending work, in service order
    order: VecDeque<InstanceId>,
    pending: HashMap<InstanceId, VecDeque<TokenId>>,
}

/// Ready tokens awaiting a worker.
///
/// FIFO within an instance and round-robin across instances, so one busy
/// instance cannot starve the others.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, instance_id: InstanceId, token_id: TokenId) {
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let tokens = inner.pending.entry(instance_id).or_default();
            let was_idle = tokens.is_empty();
            tokens.push_back(token_id);
            if was_idle {
                inner.order.push_back(instance_id);
            }
        }
        self.notify.notify_one();
    }

    /// Take the next token, rotating to the back of the line afterwards
    pub fn pop(&self) -> Option<(InstanceId, TokenId)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        while let Some(instance_id) = inner.order.pop_front() {
            let Some(tokens) = inner.pending.get_mut(&instance_id) else {
                continue;
            };
            let Some(token_id) = tokens.pop_front() else {
                inner.pending.remove(&instance_id);
                continue;
            };
            if tokens.is_empty() {
                inner.pending.remove(&instance_id);
            } else {
                inner.order.push_back(instance_id);
            }
            return Some((instance_id, token_id));
        }
        None
    }

    /// Wait for work; `None` once `cancel` fires
    pub async fn next(&self, cancel: &CancellationToken) -> Option<(InstanceId, TokenId)> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let notified = self.notify.notified();
            if let Some(item) = self.pop() {
                // Pass the wakeup on if more work is queued
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return Some(item);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Drop every queued token of an instance
    pub fn remove_instance(&self, instance_id: InstanceId) {
        let mut inner = self.lock();
        inner.pending.remove(&instance_id);
        inner.order.retain(|id| *id != instance_id);
    }

    pub fn len(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_round_robin_across_instances() {
        let queue = WorkQueue::new();
        let a = InstanceId::new();
        let b = InstanceId::new();
        let a_tokens: Vec<TokenId> = (0..3).map(|_| TokenId::new()).collect();
        let b_tokens: Vec<TokenId> = (0..2).map(|_| TokenId::new()).collect();

        for token in &a_tokens {
            queue.push(a, *token);
        }
        for token in &b_tokens {
            queue.push(b, *token);
        }
        assert_eq!(queue.len(), 5);

        let order: Vec<(InstanceId, TokenId)> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(
            order,
            vec![
                (a, a_tokens[0]),
                (b, b_tokens[0]),
                (a, a_tokens[1]),
                (b, b_tokens[1]),
                (a, a_tokens[2]),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_instance() {
        let queue = WorkQueue::new();
        let a = InstanceId::new();
        let b = InstanceId::new();
        queue.push(a, TokenId::new());
        queue.push(b, TokenId::new());
        queue.push(a, TokenId::new());

        queue.remove_instance(a);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|(id, _)| id), Some(b));
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push_and_cancel() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let instance = InstanceId::new();
        let token = TokenId::new();
        queue.push(instance, token);
        assert_eq!(waiter.await.unwrap(), Some((instance, token)));

        cancel.cancel();
        assert_eq!(queue.next(&cancel).await, None);
    }
}
