// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sample Pipeline (C4): a bounded single-producer/single-consumer queue of
//! IQ chunks between the tuner driver thread and the writer/AGC thread.
//!
//! Grounded on `FauxFaux-rtl-sdr-snipper`'s mpsc-channel-fed processing
//! thread: `std::sync::mpsc::sync_channel` gives the bounded-capacity,
//! blocking-producer/blocking-consumer, FIFO, move-not-copy contract §4.4
//! asks for almost directly. This wrapper only adds the cancellation and
//! error-kind translation §4.4/§7 require on top of raw `mpsc`.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{ArgusError, Result};

/// A single in-phase/quadrature sample, nominally in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IqSample {
    pub i: f32,
    pub q: f32,
}

impl IqSample {
    pub fn power(self) -> f32 {
        self.i * self.i + self.q * self.q
    }
}

/// A fixed-size, fully-populated run of consecutive IQ samples (§3 "IQ
/// chunk"). Chunk length is constant within one capture.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub samples: Vec<IqSample>,
}

impl Chunk {
    pub fn with_capacity(len: usize) -> Self {
        Chunk {
            samples: Vec::with_capacity(len),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of `|I|^2 + |Q|^2` across the chunk, the power estimate AGC
    /// consumes (§4.5).
    pub fn mean_power(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.samples.iter().map(|s| s.power()).sum();
        sum / self.samples.len() as f32
    }
}

/// Granularity at which `recv`/`send` re-check the cancellation token,
/// bounding cancellation latency per §5 (guidance <= 100ms).
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The producer half of a pipeline. Exclusively owned by T-prod.
pub struct PipelineSender {
    tx: SyncSender<Chunk>,
    cancel: CancelToken,
}

/// The consumer half of a pipeline. Exclusively owned by T-cons.
pub struct PipelineReceiver {
    rx: Receiver<Chunk>,
    cancel: CancelToken,
}

/// Constructs a bounded SPSC chunk pipeline with the given capacity
/// (guidance: 4-16 chunks; capacity 1 must still work, per §8 property 12).
pub fn pipeline(capacity: usize, cancel: CancelToken) -> (PipelineSender, PipelineReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::sync_channel(capacity);
    (
        PipelineSender {
            tx,
            cancel: cancel.clone(),
        },
        PipelineReceiver { rx, cancel },
    )
}

impl PipelineSender {
    /// Blocks until the chunk is enqueued, the consumer has closed its end,
    /// or cancellation is asserted. Ownership of `chunk` transfers on a
    /// successful send.
    pub fn send(&self, chunk: Chunk) -> Result<()> {
        let mut chunk = chunk;
        loop {
            self.cancel.check()?;
            match self.tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(c)) => {
                    chunk = c;
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(ArgusError::PipelineClosed(
                        "consumer end dropped".to_string(),
                    ))
                }
            }
        }
    }
}

impl PipelineReceiver {
    /// Blocks until a chunk is available, the producer has closed its end
    /// (`Ok(None)`), or cancellation is asserted.
    pub fn recv(&self) -> Result<Option<Chunk>> {
        loop {
            self.cancel.check()?;
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let (tx, rx) = pipeline(4, CancelToken::new());
        for n in 0..10 {
            let mut c = Chunk::with_capacity(1);
            c.samples.push(IqSample {
                i: n as f32,
                q: 0.0,
            });
            tx.send(c).unwrap();
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(c) = rx.recv().unwrap() {
            seen.push(c.samples[0].i as i32);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn capacity_one_is_lossless() {
        let (tx, rx) = pipeline(1, CancelToken::new());
        let handle = thread::spawn(move || {
            for n in 0..50 {
                let mut c = Chunk::with_capacity(1);
                c.samples.push(IqSample {
                    i: n as f32,
                    q: 0.0,
                });
                tx.send(c).unwrap();
            }
        });
        let mut total = 0;
        while let Some(_c) = rx.recv().unwrap() {
            total += 1;
        }
        handle.join().unwrap();
        assert_eq!(total, 50);
    }

    #[test]
    fn consumer_close_unblocks_producer() {
        let (tx, rx) = pipeline(1, CancelToken::new());
        drop(rx);
        let mut c = Chunk::with_capacity(1);
        c.samples.push(IqSample::default());
        let res = tx.send(c);
        assert!(matches!(res, Err(ArgusError::PipelineClosed(_))));
    }

    #[test]
    fn cancellation_unblocks_recv() {
        let cancel = CancelToken::new();
        let (_tx, rx) = pipeline(1, cancel.clone());
        let cancel2 = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel2.cancel("deadline");
        });
        let start = std::time::Instant::now();
        let res = rx.recv();
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn mean_power_of_unit_iq() {
        let mut c = Chunk::with_capacity(2);
        c.samples.push(IqSample { i: 1.0, q: 0.0 });
        c.samples.push(IqSample { i: 0.0, q: 1.0 });
        assert!((c.mean_power() - 1.0).abs() < 1e-6);
    }
}
