use async_channel::{Receiver, Sender};

/// A single-use broadcast signal.
///
/// Nothing is ever sent through the inner channel; closing it wakes every
/// pending [`Signal::fired`] at once and makes all later calls resolve
/// immediately. A connection uses one as its close signal, a server uses one
/// as the global shutdown signal.
#[derive(Clone, Debug)]
pub struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Signal {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    /// Returns true only for the call that actually fired the signal.
    #[inline]
    pub fn fire(&self) -> bool {
        self.tx.close()
    }

    #[inline]
    pub fn is_fired(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn fired(&self) {
        // recv only returns once the channel is closed
        let _ = self.rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Signal;

    #[test]
    fn fire_once() {
        let signal = Signal::new();
        let cloned = signal.clone();
        assert!(!cloned.is_fired());
        assert!(signal.fire());
        assert!(!cloned.fire());
        assert!(cloned.is_fired());
    }

    #[monoio::test(timer_enabled = true)]
    async fn wakes_every_waiter() {
        let signal = Signal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                monoio::spawn(async move { signal.fired().await })
            })
            .collect();
        monoio::time::sleep(Duration::from_millis(10)).await;
        signal.fire();
        for waiter in waiters {
            monoio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap();
        }
        // already fired: resolves immediately
        monoio::time::timeout(Duration::from_millis(10), signal.fired())
            .await
            .unwrap();
    }
}
