pub mod sng;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::AppError;
use crate::link::ByteLink;
use crate::relay::RelayClient;
use crate::types::Generation;
use sng::{Slot, SngFormat, VAL_KEEPALIVE};

/// Preamble byte opening every section.
pub const STARTER: u8 = 0xFD;
/// The Gen 2 mail section opens with a different starter.
pub const MAIL_STARTER: u8 = 0x20;

/// The cartridge wire escape byte; never sent inside SNG payloads either.
const WIRE_ESCAPE: u8 = 0xFE;

/// Gen 2 per-section positions past which an outbound 0xFD byte is
/// rewritten to 0xFF before it reaches the peer. Cargo-culted from
/// long-standing field reports of desyncs; kept as-is.
const GEN2_POISON_THRESHOLDS: [Option<usize>; 4] = [None, Some(441), Some(72), Some(171)];

/// How long to wait on one position before logging and carrying on.
const POSITION_STALL: Duration = Duration::from_secs(10);
/// Completion-marker exchanges after the last position.
const COMPLETION_ROUNDS: usize = 50;

/// Peer-side view of one section transfer.
struct PeerView {
    buf: Vec<u8>,
    have: Vec<bool>,
    ready: bool,
    done: bool,
}

impl PeerView {
    fn new(length: usize) -> Self {
        Self {
            buf: vec![0; length],
            have: vec![false; length],
            ready: false,
            done: false,
        }
    }
}

/// Runs the per-section exchange: the preamble handshake with the
/// cartridge, then either interleaved byte-for-byte mediation between
/// cartridge and peer, or a buffered feed from previously received peer
/// data.
pub struct SectionExchanger<'a, L: ByteLink> {
    link: &'a mut L,
    relay: &'a RelayClient,
    gen: Generation,
    stop: &'a AtomicBool,
    tag: [u8; 4],
    format: SngFormat,
    format_locked: bool,
}

impl<'a, L: ByteLink> SectionExchanger<'a, L> {
    pub fn new(
        link: &'a mut L,
        relay: &'a RelayClient,
        gen: Generation,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            link,
            relay,
            gen,
            stop,
            tag: gen.tag("SNG"),
            format: SngFormat::New,
            format_locked: false,
        }
    }

    fn starter(&self, section: usize) -> u8 {
        if self.gen == Generation::Two && section == 3 {
            MAIL_STARTER
        } else {
            STARTER
        }
    }

    fn check_stop(&self) -> Result<(), AppError> {
        if self.stop.load(Ordering::Relaxed) {
            Err(AppError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Drive the cartridge into a section: send the starter until it is
    /// echoed, then keep sending it until the response departs from the
    /// starter. That departing byte is payload byte 0.
    async fn preamble(&mut self, starter: u8) -> Result<u8, AppError> {
        loop {
            self.check_stop()?;
            if self.link.exchange(starter)? == starter {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        loop {
            self.check_stop()?;
            let response = self.link.exchange(starter)?;
            if response != starter {
                return Ok(response);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Outbound byte filter for SNG payloads: the wire escape never
    /// travels as data, and known poison positions lose their 0xFD.
    fn filter_outbound(&self, section: usize, pos: usize, val: u8) -> u8 {
        if val == WIRE_ESCAPE {
            return 0xFF;
        }
        if self.gen == Generation::Two && val == STARTER {
            if let Some(Some(threshold)) = GEN2_POISON_THRESHOLDS.get(section) {
                if pos >= *threshold {
                    tracing::warn!(
                        "poison byte 0xFD at section {section} pos {pos} rewritten to 0xFF"
                    );
                    return 0xFF;
                }
            }
        }
        val
    }

    /// Publish our view of the section: the most recent positions up to
    /// `upto` (inclusive), or a completion marker once past the end.
    fn publish(&self, section: usize, own: &[u8], upto: usize) -> Result<(), AppError> {
        let per_frame = sng::slots_per_frame(self.format);
        let mut slots = Vec::with_capacity(per_frame);
        if upto >= own.len() {
            slots.push(Slot {
                pos: own.len() as u16,
                val: 0,
                section: section as u8,
            });
        } else {
            let first = (upto + 1).saturating_sub(per_frame);
            for pos in first..=upto {
                slots.push(Slot {
                    pos: pos as u16,
                    val: self.filter_outbound(section, pos, own[pos]),
                    section: section as u8,
                });
            }
        }
        self.relay
            .send(self.tag, &sng::encode(self.format, section as u8, &slots))?;
        self.relay.request(self.tag)?;
        Ok(())
    }

    /// Announce readiness for a section until data flows.
    fn publish_ready(&self, section: usize) -> Result<(), AppError> {
        let slots = [Slot::ready(section as u8)];
        self.relay
            .send(self.tag, &sng::encode(self.format, section as u8, &slots))?;
        self.relay.request(self.tag)?;
        Ok(())
    }

    /// Drain the SNG inbox into the peer view. Detects the peer's frame
    /// format from the first well-formed frame.
    fn collect(&mut self, section: usize, view: &mut PeerView) {
        let Some(raw) = self.relay.take(self.tag) else {
            return;
        };
        if !self.format_locked {
            if let Some(format) = sng::detect(&raw) {
                if format != self.format {
                    tracing::info!("peer uses {:?} SNG frame format", format);
                }
                self.format = format;
                self.format_locked = true;
            }
        }
        let Some(slots) = sng::decode(&raw) else {
            return;
        };
        for slot in slots {
            if slot.section as usize != section {
                continue;
            }
            if slot.is_ready() {
                view.ready = true;
                continue;
            }
            let pos = slot.pos as usize;
            if pos >= view.buf.len() {
                view.done = true;
                continue;
            }
            if slot.val == VAL_KEEPALIVE {
                continue;
            }
            // Implicit rendezvous: data for this section means the peer
            // is in it.
            view.ready = true;
            view.buf[pos] = slot.val;
            view.have[pos] = true;
        }
    }

    /// Synchronous (interleaved) exchange of one section. Returns the
    /// bytes our cartridge produced and the bytes the peer's did.
    pub async fn exchange_sync(
        &mut self,
        section: usize,
        length: usize,
    ) -> Result<(Vec<u8>, Vec<u8>), AppError> {
        tracing::info!("section {section}: synchronous exchange of {length} bytes");
        let mut view = PeerView::new(length);

        // Rendezvous: wait for an explicit ready sentinel or implicit
        // data-bearing slots for this section.
        let mut stall = tokio::time::Instant::now();
        while !view.ready {
            self.check_stop()?;
            self.publish_ready(section)?;
            self.collect(section, &mut view);
            if stall.elapsed() > POSITION_STALL {
                tracing::warn!("section {section}: still waiting for peer rendezvous");
                stall = tokio::time::Instant::now();
            }
            tokio::time::sleep(self.relay.poll_interval()).await;
        }

        let starter = self.starter(section);
        let mut own = vec![0u8; length];
        own[0] = self.preamble(starter).await?;

        for i in 0..length {
            let mut stall = tokio::time::Instant::now();
            while !view.have[i] {
                self.check_stop()?;
                self.publish(section, &own, i)?;
                self.collect(section, &mut view);
                if stall.elapsed() > POSITION_STALL {
                    tracing::warn!("section {section}: no peer byte for pos {i} yet");
                    stall = tokio::time::Instant::now();
                }
                tokio::time::sleep(self.relay.poll_interval()).await;
            }
            let response = self.link.exchange(view.buf[i])?;
            if i + 1 < length {
                own[i + 1] = response;
            }
        }

        // Trade completion markers until the peer confirms or we give up
        // politely; repeated markers are idempotent on their side.
        for _ in 0..COMPLETION_ROUNDS {
            self.check_stop()?;
            self.publish(section, &own, length)?;
            self.collect(section, &mut view);
            if view.done {
                break;
            }
            tokio::time::sleep(self.relay.poll_interval()).await;
        }
        self.publish(section, &own, length)?;
        tracing::info!("section {section}: exchange complete");
        Ok((own, view.buf))
    }

    /// Buffered exchange: feed previously received peer bytes to the
    /// cartridge one position at a time, with no per-byte peer I/O.
    pub async fn exchange_buffered(
        &mut self,
        section: usize,
        feed: &[u8],
    ) -> Result<Vec<u8>, AppError> {
        tracing::info!("section {section}: buffered feed of {} bytes", feed.len());
        let starter = self.starter(section);
        let mut own = vec![0u8; feed.len()];
        own[0] = self.preamble(starter).await?;
        for (i, &out) in feed.iter().enumerate() {
            self.check_stop()?;
            let response = self.link.exchange(out)?;
            if i + 1 < feed.len() {
                own[i + 1] = response;
            }
        }
        Ok(own)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::ScriptedLink;
    use crate::relay::Frame;

    fn stop_flag() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[tokio::test]
    async fn test_buffered_exchange_feeds_and_collects() {
        // Echo starter once, then payload bytes 0xA0.. appear.
        let replies = vec![STARTER, 0xA0, 0xA1, 0xA2, 0xA3, 0x00];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();
        let mut ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);

        let own = ex.exchange_buffered(1, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(own, vec![0xA0, 0xA1, 0xA2, 0xA3]);
        // Two starters for the preamble, then the peer feed.
        assert_eq!(link.sent, vec![STARTER, STARTER, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_preamble_skips_no_data() {
        let replies = vec![0x00, 0x00, STARTER, STARTER, 0x55];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();
        let mut ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
        let own = ex.exchange_buffered(0, &[9]).await.unwrap();
        assert_eq!(own, vec![0x55]);
    }

    #[tokio::test]
    async fn test_mail_section_uses_its_starter() {
        let replies = vec![MAIL_STARTER, 0x77, 0x00];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();
        let mut ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
        let own = ex.exchange_buffered(3, &[0x10, 0x11]).await.unwrap();
        assert_eq!(own, vec![0x77, 0x00]);
        assert_eq!(link.sent[0], MAIL_STARTER);
    }

    #[tokio::test]
    async fn test_stop_flag_aborts_buffered() {
        let mut link = ScriptedLink::new(vec![STARTER, 0x01, 0x02]);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = AtomicBool::new(true);
        let mut ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
        let err = ex.exchange_buffered(1, &[1, 2]).await;
        assert!(matches!(err, Err(AppError::Stopped)));
    }

    #[test]
    fn test_poison_filter_rewrites_late_fd() {
        let mut link = ScriptedLink::new(vec![]);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();
        let ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
        assert_eq!(ex.filter_outbound(1, 441, 0xFD), 0xFF);
        assert_eq!(ex.filter_outbound(1, 440, 0xFD), 0xFD);
        assert_eq!(ex.filter_outbound(2, 72, 0xFD), 0xFF);
        assert_eq!(ex.filter_outbound(3, 171, 0xFD), 0xFF);
        assert_eq!(ex.filter_outbound(0, 5, 0xFD), 0xFD);
    }

    #[test]
    fn test_outbound_escape_never_travels() {
        let mut link = ScriptedLink::new(vec![]);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();
        let ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
        assert_eq!(ex.filter_outbound(1, 0, 0xFE), 0xFF);
    }

    #[tokio::test]
    async fn test_sync_exchange_against_scripted_peer() {
        const LEN: usize = 4;
        // Cartridge: echoes starter, yields 0x10, then one byte per peer
        // byte fed in.
        let replies = vec![STARTER, 0x10, 0x11, 0x12, 0x13, 0x00];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let stop = stop_flag();

        let peer_bytes = [0xA0u8, 0xA1, 0xA2, 0xA3];
        let exchange = async {
            let mut ex = SectionExchanger::new(&mut link, &relay, Generation::Two, &stop);
            ex.exchange_sync(1, LEN).await
        };
        let inject = async {
            // The peer cycles ready, data, and completion frames; the
            // last-value inbox plus idempotent positions make the order
            // forgiving.
            let data: Vec<Slot> = peer_bytes
                .iter()
                .enumerate()
                .map(|(pos, &val)| Slot {
                    pos: pos as u16,
                    val,
                    section: 1,
                })
                .collect();
            let frames = [
                sng::encode_new(&[Slot::ready(1)]),
                sng::encode_new(&data),
                sng::encode_new(&[Slot {
                    pos: LEN as u16,
                    val: 0,
                    section: 1,
                }]),
            ];
            for _ in 0..200 {
                for f in &frames {
                    relay.inject(
                        &Frame::Set {
                            tag: *b"SNG2",
                            payload: f.clone(),
                        }
                        .encode(),
                    );
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        };

        let (result, _) = tokio::join!(exchange, inject);
        let (own, peer) = result.unwrap();
        assert_eq!(own, vec![0x10, 0x11, 0x12, 0x13]);
        assert_eq!(peer, peer_bytes.to_vec());
    }
}
