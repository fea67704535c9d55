//! A scriptable transport endpoint for protocol tests.
//!
//! The test drives both ends of the conversation: it opens the transport,
//! injects inbound frames, toggles writeability, and inspects everything
//! the connection sent.

use crate::error::BlipError;
use crate::protocol::frame::FrameCodec;
use crate::protocol::FrameFlags;
use crate::transport::{Transport, TransportObserver};
use parking_lot::Mutex;
use std::sync::Arc;

struct MockState {
    observer: Option<Arc<dyn TransportObserver>>,
    writeable: bool,
    closed: bool,
    sent: Vec<Vec<u8>>,
    close_status: Option<(u16, String)>,
}

/// A transport whose peer is the test itself.
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport {
            state: Mutex::new(MockState {
                observer: None,
                writeable: true,
                closed: false,
                sent: Vec::new(),
                close_status: None,
            }),
        })
    }

    fn observer(&self) -> Option<Arc<dyn TransportObserver>> {
        self.state.lock().observer.clone()
    }

    /// Signal `on_open` to the attached connection.
    pub fn open(&self) {
        if let Some(observer) = self.observer() {
            observer.on_open();
        }
    }

    /// Deliver raw bytes as one inbound transport message.
    pub fn inject(&self, data: Vec<u8>) {
        if let Some(observer) = self.observer() {
            observer.on_message(data);
        }
    }

    /// Encode and deliver one inbound frame.
    pub fn inject_frame(
        &self,
        number: u64,
        flags: FrameFlags,
        payload: &[u8],
    ) -> Result<(), BlipError> {
        let bytes = FrameCodec::new().encode(number, flags, payload)?;
        self.inject(bytes);
        Ok(())
    }

    /// Toggle writeability; a rising edge signals `on_writeable`.
    pub fn set_writeable(&self, writeable: bool) {
        let became_writeable = {
            let mut state = self.state.lock();
            let rising = writeable && !state.writeable;
            state.writeable = writeable;
            rising
        };
        if became_writeable {
            if let Some(observer) = self.observer() {
                observer.on_writeable();
            }
        }
    }

    /// Every transport message the connection sent, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    /// The close status the connection requested, if it closed.
    pub fn close_status(&self) -> Option<(u16, String)> {
        self.state.lock().close_status.clone()
    }

    /// Simulate the peer closing the connection.
    pub fn peer_close(&self, status: u16, reason: &str) {
        if let Some(observer) = self.observer() {
            observer.on_close(status, reason.to_string());
        }
    }

    /// Simulate a fatal transport failure: `on_error` followed by an
    /// abnormal `on_close`.
    pub fn fail(&self, code: i32, reason: &str) {
        if let Some(observer) = self.observer() {
            observer.on_error(code, reason.to_string());
            observer.on_close(crate::protocol::close_code::ABNORMAL, reason.to_string());
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, observer: Arc<dyn TransportObserver>) {
        self.state.lock().observer = Some(observer);
    }

    fn send(&self, data: Vec<u8>) -> Result<(), BlipError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BlipError::ConnectionClosed);
        }
        state.sent.push(data);
        Ok(())
    }

    fn close(&self, status: u16, reason: &str) {
        let observer = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                state.close_status = Some((status, reason.to_string()));
                state.observer.clone()
            }
        };
        if let Some(observer) = observer {
            observer.on_close(status, reason.to_string());
        }
    }

    fn is_writeable(&self) -> bool {
        let state = self.state.lock();
        state.writeable && !state.closed
    }
}
