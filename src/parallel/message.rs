//! Typed duplex channels between the coordinator and island workers, built
//! on lock-free crossbeam queues. Delivery is FIFO per direction; workers
//! drain all pending messages at the top of each step.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// One endpoint of a duplex channel: sends `S`, receives `R`.
pub struct DuplexChannel<S, R> {
    tx: Sender<S>,
    rx: Receiver<R>,
}

impl<S, R> DuplexChannel<S, R> {
    /// Sending to a dropped peer is a no-op: the worker is already gone.
    pub fn send(&self, message: S) {
        let _ = self.tx.send(message);
    }

    pub fn try_recv(&self) -> Option<R> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drains everything queued right now.
    pub fn drain(&self) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(message) = self.try_recv() {
            out.push(message);
        }
        out
    }
}

/// Builds the two endpoints of a duplex channel.
pub fn duplex<A, B>() -> (DuplexChannel<A, B>, DuplexChannel<B, A>) {
    let (tx_ab, rx_ab) = unbounded::<A>();
    let (tx_ba, rx_ba) = unbounded::<B>();
    (
        DuplexChannel { tx: tx_ab, rx: rx_ba },
        DuplexChannel { tx: tx_ba, rx: rx_ab },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_arrive_in_order() {
        let (front, back) = duplex::<u32, &str>();
        front.send(1);
        front.send(2);
        front.send(3);
        assert_eq!(back.drain(), vec![1, 2, 3]);

        back.send("done");
        assert_eq!(front.try_recv(), Some("done"));
        assert_eq!(front.try_recv(), None);
    }
}
