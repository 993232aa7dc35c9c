pub mod gen12;
pub mod gen3;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::data::StaticTables;
use crate::error::AppError;
use crate::link::{ByteLink, NO_DATA};
use crate::negotiate::negotiate;
use crate::relay::{RelayClient, Sequenced};
use crate::sanity::Sanitizer;
use crate::types::{Generation, TradeMode, TradeRecord, TradeTarget};

/// Byte sent while polling the cartridge for a user event.
const FILLER: u8 = 0x00;
/// Consecutive identical reads required before trusting a user event.
const STABLE_READS: usize = 10;
/// Wire keep-alive; never a user event.
const KEEPALIVE: u8 = 0xFE;
/// Cadence of the version-announce flood during trade setup.
const VERSION_FLOOD_PERIOD: Duration = Duration::from_millis(200);
/// Announced client version, `VEC`/`VES` payload.
pub const CLIENT_VERSION: [u8; 6] = [0x00, 0x01, 0x00, 0x05, 0x00, 0x00];

/// How long to wait for the peer to show up in the room.
pub(crate) const PEER_JOIN_TIMEOUT: Duration = Duration::from_secs(120);

/// The per-generation trade state machine. Single-threaded and
/// cooperative: one long sequence of suspension points, each either a
/// cartridge exchange or a relay operation. All shared state is owned
/// here; the stop flag is rechecked at every suspension point.
pub struct Mediator<'a, L: ByteLink> {
    pub(crate) link: &'a mut L,
    pub(crate) relay: &'a RelayClient,
    pub(crate) tables: &'a StaticTables,
    pub(crate) sanitizer: Sanitizer<'a>,
    pub(crate) gen: Generation,
    pub(crate) mode: TradeMode,
    pub(crate) target: TradeTarget,
    pub(crate) japanese: bool,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) seq: Sequenced,
    pub(crate) records: Vec<TradeRecord>,
    pub(crate) join_timeout: Duration,
}

impl<'a, L: ByteLink> Mediator<'a, L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: &'a mut L,
        relay: &'a RelayClient,
        tables: &'a StaticTables,
        sanity_checks: bool,
        gen: Generation,
        mode: TradeMode,
        target: TradeTarget,
        japanese: bool,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let sanitizer = Sanitizer::new(tables, gen, sanity_checks);
        Self {
            link,
            relay,
            tables,
            sanitizer,
            gen,
            mode,
            target,
            japanese,
            stop,
            seq: Sequenced::new(),
            records: Vec::new(),
            join_timeout: PEER_JOIN_TIMEOUT,
        }
    }

    pub fn set_join_timeout(&mut self, timeout: Duration) {
        self.join_timeout = timeout;
    }

    /// Pull a counter-tagged peer event, or fail the session when the
    /// peer stays silent past the join timeout.
    pub(crate) async fn pull_event(&mut self, tag: [u8; 4]) -> Result<Vec<u8>, AppError> {
        let timeout = self.join_timeout;
        self.relay
            .pull_with_counter(&mut self.seq, tag, timeout)
            .await
            .ok_or(AppError::PeerTimeout(timeout.as_secs()))
    }

    pub async fn run(&mut self) -> Result<(), AppError> {
        // The server polls our version on demand via `VES`.
        self.relay.set_outbox(self.gen.tag("VES"), &CLIENT_VERSION);
        if self.target == TradeTarget::Pool {
            // The pool server always feeds us buffered data.
            self.mode = TradeMode::Buffered;
        } else {
            let offered = self.mode;
            let mut confirm = |winner: TradeMode| {
                tracing::info!("other player wants {winner:?}; accepting");
                true
            };
            self.mode = negotiate(self.relay, &mut self.seq, self.gen, offered, &mut confirm)
                .await?;
        }
        tracing::info!(
            "starting {:?} {:?} trade session in {:?} mode",
            self.gen,
            self.target,
            self.mode
        );
        let result = match self.gen {
            Generation::One | Generation::Two => gen12::run(self).await,
            Generation::Three => gen3::run(self).await,
        };
        match result {
            Err(AppError::Stopped) => {
                tracing::info!("trade session stopped by user");
                Ok(())
            }
            other => other,
        }
    }

    pub fn trade_log(&self) -> &[TradeRecord] {
        &self.records
    }

    pub(crate) fn check_stop(&self) -> Result<(), AppError> {
        if self.stop.load(Ordering::Relaxed) {
            Err(AppError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Poll the cartridge with a filler byte until `accept`ed responses
    /// repeat `STABLE_READS` times in a row. Filters out the no-data
    /// sentinel, keep-alives, and single glitched reads.
    pub(crate) async fn read_stable(
        &mut self,
        filler: u8,
        accept: impl Fn(u8) -> bool,
    ) -> Result<u8, AppError> {
        let mut last = None;
        let mut streak = 0;
        loop {
            self.check_stop()?;
            let response = self.link.exchange(filler)?;
            if response == NO_DATA || response == KEEPALIVE || !accept(response) {
                last = None;
                streak = 0;
            } else if last == Some(response) {
                streak += 1;
                if streak >= STABLE_READS {
                    return Ok(response);
                }
            } else {
                last = Some(response);
                streak = 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Send `out` until the cartridge responds with `want`, `times` in a
    /// row.
    pub(crate) async fn drain_until(
        &mut self,
        out: u8,
        want: u8,
        times: usize,
    ) -> Result<(), AppError> {
        let mut streak = 0;
        loop {
            self.check_stop()?;
            if self.link.exchange(out)? == want {
                streak += 1;
                if streak >= times {
                    return Ok(());
                }
            } else {
                streak = 0;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drive one handshake table: for each step, send its byte until the
    /// cartridge's response is in the step's accept set.
    pub(crate) async fn handshake(&mut self, steps: &[(u8, &[u8])]) -> Result<(), AppError> {
        for &(out, accepts) in steps {
            loop {
                self.check_stop()?;
                let response = self.link.exchange(out)?;
                if accepts.contains(&response) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Ok(())
    }

    /// Start the periodic version announce. Runs until stopped; survives
    /// peer/relay races during the enter/sit phases.
    pub(crate) fn start_version_flood(&self) -> VersionFlood {
        VersionFlood::start(self.relay.clone(), self.gen.tag("VEC"))
    }
}

/// Background `VEC` announcer, emitting the client version every 200 ms
/// while trade setup is in progress.
pub(crate) struct VersionFlood {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl VersionFlood {
    fn start(relay: RelayClient, tag: [u8; 4]) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = tokio::spawn(async move {
            while !flag.load(Ordering::Relaxed) {
                if relay.send(tag, &CLIENT_VERSION).is_err() {
                    break;
                }
                tokio::time::sleep(VERSION_FLOOD_PERIOD).await;
            }
        });
        Self { stop, handle }
    }

    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::ScriptedLink;

    fn tables() -> StaticTables {
        StaticTables::empty(Generation::Two)
    }

    fn mediator<'a>(
        link: &'a mut ScriptedLink,
        relay: &'a RelayClient,
        tables: &'a StaticTables,
    ) -> Mediator<'a, ScriptedLink> {
        Mediator::new(
            link,
            relay,
            tables,
            false,
            Generation::Two,
            TradeMode::Synchronous,
            TradeTarget::Link,
            false,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_read_stable_requires_consecutive_reads() {
        // A glitched 0x71 resets the streak; ten 0x70s then succeed.
        let mut replies = vec![0x70; 5];
        replies.push(0x71);
        replies.extend(vec![0x70; 10]);
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let t = tables();
        let mut m = mediator(&mut link, &relay, &t);
        let got = m.read_stable(FILLER, |b| (0x70..=0x7F).contains(&b)).await;
        assert_eq!(got.unwrap(), 0x70);
    }

    #[tokio::test]
    async fn test_read_stable_skips_no_data_and_keepalive() {
        let mut replies = vec![NO_DATA, KEEPALIVE, NO_DATA];
        replies.extend(vec![0x72; 10]);
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let t = tables();
        let mut m = mediator(&mut link, &relay, &t);
        let got = m.read_stable(FILLER, |b| b == 0x72).await;
        assert_eq!(got.unwrap(), 0x72);
    }

    #[tokio::test]
    async fn test_handshake_walks_accept_sets() {
        // Gen 2 enter-room exchange: garbage is retried until each
        // sentinel appears.
        let replies = vec![0x00, 0x61, 0xD1, 0x00, 0x11, 0xFE, 0xFE];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let t = tables();
        let mut m = mediator(&mut link, &relay, &t);
        let steps: &[(u8, &[u8])] = &[
            (0x01, &[0x61]),
            (0x61, &[0xD1]),
            (0xD1, &[0x00]),
            (0x00, &[0xFE]),
            (0xFE, &[0xFE]),
        ];
        m.handshake(steps).await.unwrap();
        assert_eq!(link.sent[0], 0x01);
        assert!(link.replies.is_empty());
    }

    #[tokio::test]
    async fn test_drain_until_counts_consecutive() {
        let replies = vec![0x7F, 0x00, 0x00, 0x12, 0x00, 0x00, 0x00];
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let t = tables();
        let mut m = mediator(&mut link, &relay, &t);
        m.drain_until(0x7F, 0x00, 3).await.unwrap();
        assert!(link.replies.is_empty());
    }

    #[tokio::test]
    async fn test_stop_flag_aborts_read_stable() {
        let mut link = ScriptedLink::new(vec![0x70; 100]);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let t = tables();
        let stop = Arc::new(AtomicBool::new(true));
        let mut m = Mediator::new(
            &mut link,
            &relay,
            &t,
            false,
            Generation::Two,
            TradeMode::Synchronous,
            TradeTarget::Link,
            false,
            stop,
        );
        assert!(matches!(
            m.read_stable(FILLER, |_| true).await,
            Err(AppError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_version_flood_announces_until_stopped() {
        let (relay, mut rx) = RelayClient::test_pair(Duration::from_millis(1));
        let flood = VersionFlood::start(relay, *b"VEC2");
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&first[1..5], b"VEC2");
        flood.stop();
    }
}
