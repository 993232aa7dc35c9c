use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::AppError;
use crate::relay::{RelayClient, Sequenced};
use crate::types::{Generation, TradeMode};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ROUNDS: usize = 10;
const MAX_REDRAWS: usize = 32;

/// Who won a tiebreak roll; `None` means a tie, re-draw.
fn tiebreak(own_roll: u8, peer_roll: u8) -> Option<bool> {
    if own_roll == peer_roll {
        None
    } else {
        Some(own_roll > peer_roll)
    }
}

/// Apply a decided tiebreak: the winner keeps its mode, the loser is
/// offered the winner's mode and may refuse.
fn apply_tiebreak(
    own_mode: TradeMode,
    peer_mode: TradeMode,
    we_win: bool,
    confirm: &mut dyn FnMut(TradeMode) -> bool,
) -> TradeMode {
    if we_win {
        own_mode
    } else if confirm(peer_mode) {
        peer_mode
    } else {
        own_mode
    }
}

/// One-shot Buffered-vs-Synchronous agreement between peers.
///
/// Both sides pre-publish their `BUF` mode so the counterpart's first poll
/// is satisfied immediately. Disagreements go to a counter-tagged random
/// tiebreak over `NEG`; the loser's `confirm` callback may refuse the
/// winner's mode, forcing another round. Failure to converge defaults to
/// Synchronous.
pub async fn negotiate(
    relay: &RelayClient,
    seq: &mut Sequenced,
    gen: Generation,
    own_mode: TradeMode,
    confirm: &mut dyn FnMut(TradeMode) -> bool,
) -> Result<TradeMode, AppError> {
    let buf_tag = gen.tag("BUF");
    let neg_tag = gen.tag("NEG");
    let mut mode = own_mode;
    let mut rng = SmallRng::from_entropy();

    relay.send_with_counter(seq, buf_tag, &[mode.wire_byte()])?;

    for round in 0..MAX_ROUNDS {
        let peer = relay
            .pull_with_counter(seq, buf_tag, NEGOTIATION_TIMEOUT)
            .await
            .ok_or(AppError::PeerTimeout(NEGOTIATION_TIMEOUT.as_secs()))?;
        let peer_mode = peer
            .first()
            .copied()
            .and_then(TradeMode::from_wire_byte)
            .unwrap_or(TradeMode::Synchronous);

        if peer_mode == mode {
            tracing::info!("mode negotiation settled on {mode:?} (round {round})");
            return Ok(mode);
        }

        let mut we_win = None;
        for _ in 0..MAX_REDRAWS {
            let roll: u8 = rng.gen();
            relay.send_with_counter(seq, neg_tag, &[roll])?;
            let peer_roll = relay
                .pull_with_counter(seq, neg_tag, NEGOTIATION_TIMEOUT)
                .await
                .ok_or(AppError::PeerTimeout(NEGOTIATION_TIMEOUT.as_secs()))?
                .first()
                .copied()
                .unwrap_or(0);
            if let Some(win) = tiebreak(roll, peer_roll) {
                we_win = Some(win);
                break;
            }
            tracing::debug!("negotiation tie at {roll}, re-drawing");
        }
        let Some(we_win) = we_win else { break };

        mode = apply_tiebreak(mode, peer_mode, we_win, confirm);
        // Fresh BUF either way so the next round's poll sees a new counter.
        relay.send_with_counter(seq, buf_tag, &[mode.wire_byte()])?;
    }

    tracing::warn!("mode negotiation did not converge, defaulting to Synchronous");
    Ok(TradeMode::Synchronous)
}
