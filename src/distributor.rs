use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nal::AccessUnit;
use tokio::sync::Notify;

/// Bounded single-producer/single-consumer channel with a newest-wins
/// overflow policy: on push when full, the oldest element is dropped to make
/// room for the new one. This is the pipeline's entire freshness policy —
/// there is no upstream backpressure.
struct Inner {
    queue: Mutex<VecDeque<AccessUnit>>,
    notify: Notify,
    capacity: usize,
}

pub struct DistributorSender {
    inner: Arc<Inner>,
}

pub struct DistributorReceiver {
    inner: Arc<Inner>,
}

pub fn channel(capacity: usize) -> (DistributorSender, DistributorReceiver) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
    });
    (
        DistributorSender {
            inner: inner.clone(),
        },
        DistributorReceiver { inner },
    )
}

impl DistributorSender {
    pub fn push(&self, unit: AccessUnit) {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
        }
        queue.push_back(unit);
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl DistributorReceiver {
    pub async fn recv(&mut self) -> AccessUnit {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(unit) = queue.pop_front() {
                    return unit;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn unit(n: u8) -> AccessUnit {
        AccessUnit {
            data: vec![n].into(),
            contains_idr: false,
            duration: Duration::from_millis(33),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let (tx, mut rx) = channel(2);
        tx.push(unit(1));
        tx.push(unit(2));
        tx.push(unit(3));

        let first = rx.recv().await;
        let second = rx.recv().await;
        assert_eq!(first.data[0], 2);
        assert_eq!(second.data[0], 3);
    }

    #[tokio::test]
    async fn recv_waits_for_push() {
        let (tx, mut rx) = channel(3);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.push(unit(42));
        let got = handle.await.unwrap();
        assert_eq!(got.data[0], 42);
    }
}
