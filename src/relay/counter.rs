use std::time::Duration;

use rand::Rng;

use super::client::RelayClient;
use super::frame::tag_str;

/// Half the counter space. An incoming counter is fresh iff it is at most
/// this far ahead of the expected one, modulo 256.
const ACCEPT_WINDOW: u8 = 128;

/// Counter-tagged channel state: a wrapping outbound counter and the next
/// expected inbound counter.
///
/// The outbound counter starts at a random value; the inbound expectation
/// is seeded by the first accepted frame, never assumed to be zero. Both
/// survive across trade cycles within a session.
pub struct Sequenced {
    next_out: u8,
    expect_in: Option<u8>,
}

impl Sequenced {
    pub fn new() -> Self {
        Self {
            next_out: rand::thread_rng().gen(),
            expect_in: None,
        }
    }

    /// Prepend the outbound counter to `body` and advance it.
    pub fn attach(&mut self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.next_out);
        out.extend_from_slice(body);
        self.next_out = self.next_out.wrapping_add(1);
        out
    }

    /// Strip the counter from an inbound frame. Returns the body if the
    /// counter advances the expectation within the accept window; stale
    /// frames (including reflections of our own traffic) yield `None`.
    pub fn accept(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (&counter, body) = frame.split_first()?;
        match self.expect_in {
            None => {}
            Some(expected) => {
                if counter.wrapping_sub(expected) > ACCEPT_WINDOW {
                    return None;
                }
            }
        }
        self.expect_in = Some(counter.wrapping_add(1));
        Some(body.to_vec())
    }
}

impl Default for Sequenced {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    /// Publish `body` under `tag` with a fresh outbound counter.
    pub fn send_with_counter(
        &self,
        seq: &mut Sequenced,
        tag: [u8; 4],
        body: &[u8],
    ) -> Result<(), super::RelayError> {
        self.send(tag, &seq.attach(body))
    }

    /// Take the inbox value for `tag` if it carries a fresh counter.
    /// Stale frames are consumed and dropped so the next poll sees new data.
    pub fn take_with_counter(&self, seq: &mut Sequenced, tag: [u8; 4]) -> Option<Vec<u8>> {
        let frame = self.take(tag)?;
        match seq.accept(&frame) {
            Some(body) => Some(body),
            None => {
                tracing::debug!("stale {} frame dropped", tag_str(&tag));
                None
            }
        }
    }

    /// Poll the room for a counter-advancing `tag` frame until `timeout`.
    pub async fn pull_with_counter(
        &self,
        seq: &mut Sequenced,
        tag: [u8; 4],
        timeout: Duration,
    ) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(body) = self.take_with_counter(seq, tag) {
                return Some(body);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            if self.request(tag).is_err() {
                return None;
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}
