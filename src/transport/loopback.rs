//! An in-process transport pair for tests and the example harness.
//!
//! Two endpoints are wired back to back: what one sends, the other's
//! observer receives, optionally after a simulated latency. Delivery order
//! is preserved in both modes. Either endpoint can record the raw frames it
//! sent so tests can assert on the wire trace.

use crate::actor::Timer;
use crate::error::BlipError;
use crate::transport::{Transport, TransportObserver};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct LoopbackState {
    peer: Weak<LoopbackTransport>,
    observer: Option<Arc<dyn TransportObserver>>,
    open: bool,
    closed: bool,
    sent: Vec<Vec<u8>>,
}

/// One endpoint of an in-process transport pair.
///
/// The pair opens automatically once both endpoints have a connection
/// attached.
pub struct LoopbackTransport {
    latency: Option<Duration>,
    record: bool,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    /// Create a connected pair. `latency` delays each delivery by the given
    /// amount, preserving order.
    pub fn pair(latency: Option<Duration>) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        Self::pair_with(latency, false)
    }

    /// Like [`LoopbackTransport::pair`], additionally recording every frame
    /// each endpoint sends.
    pub fn recorded_pair(
        latency: Option<Duration>,
    ) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        Self::pair_with(latency, true)
    }

    fn pair_with(
        latency: Option<Duration>,
        record: bool,
    ) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let endpoint = |latency| {
            Arc::new(LoopbackTransport {
                latency,
                record,
                state: Mutex::new(LoopbackState {
                    peer: Weak::new(),
                    observer: None,
                    open: false,
                    closed: false,
                    sent: Vec::new(),
                }),
            })
        };
        let a = endpoint(latency);
        let b = endpoint(latency);
        a.state.lock().peer = Arc::downgrade(&b);
        b.state.lock().peer = Arc::downgrade(&a);
        (a, b)
    }

    /// The raw frames sent through this endpoint, in send order. Empty
    /// unless the pair was created with recording enabled.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    fn peer(&self) -> Option<Arc<LoopbackTransport>> {
        self.state.lock().peer.upgrade()
    }

    fn observer(&self) -> Option<Arc<dyn TransportObserver>> {
        self.state.lock().observer.clone()
    }

    /// Fire `on_open` on this endpoint once, when both sides are attached.
    fn open_if_ready(&self, peer: &LoopbackTransport) {
        let peer_ready = peer.state.lock().observer.is_some();
        if !peer_ready {
            return;
        }
        let observer = {
            let mut state = self.state.lock();
            if state.open || state.observer.is_none() {
                None
            } else {
                state.open = true;
                state.observer.clone()
            }
        };
        if let Some(observer) = observer {
            observer.on_open();
        }
    }

    fn peer_closed(&self, status: u16, reason: &str) {
        let observer = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                state.observer.clone()
            }
        };
        if let Some(observer) = observer {
            observer.on_close(status, reason.to_string());
        }
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self, observer: Arc<dyn TransportObserver>) {
        self.state.lock().observer = Some(observer);
        if let Some(peer) = self.peer() {
            self.open_if_ready(&peer);
            peer.open_if_ready(self);
        }
    }

    fn send(&self, data: Vec<u8>) -> Result<(), BlipError> {
        if self.state.lock().closed {
            return Err(BlipError::ConnectionClosed);
        }
        if self.record {
            self.state.lock().sent.push(data.clone());
        }
        let observer = self
            .peer()
            .and_then(|peer| peer.observer())
            .ok_or(BlipError::ConnectionClosed)?;
        match self.latency {
            Some(delay) => {
                // The timer service fires same-deadline callbacks in arm
                // order, so delayed delivery stays ordered.
                Timer::after(delay, move || observer.on_message(data));
            }
            None => observer.on_message(data),
        }
        Ok(())
    }

    fn close(&self, status: u16, reason: &str) {
        let observer = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                state.observer.clone()
            }
        };
        let Some(observer) = observer else {
            return;
        };
        observer.on_close(status, reason.to_string());
        if let Some(peer) = self.peer() {
            match self.latency {
                Some(delay) => {
                    let status_copy = status;
                    let reason_copy = reason.to_string();
                    Timer::after(delay, move || peer.peer_closed(status_copy, &reason_copy));
                }
                None => peer.peer_closed(status, reason),
            }
        }
    }

    fn is_writeable(&self) -> bool {
        !self.state.lock().closed
    }
}
