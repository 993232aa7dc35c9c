use std::collections::VecDeque;
use std::time::Duration;

use super::Mediator;
use crate::data::text::{decode_field, TERMINATOR_GEN3};
use crate::error::AppError;
use crate::link::ByteLink;
use crate::party::gen3::{Pokemon3, RECORD_LEN};
use crate::types::{TradeOutcome, TradeRecord, TradeTarget};

/// Control bits in the top byte of each 32-bit frame.
const F_SENDING: u32 = 0x10 << 24;
const F_DONE: u32 = 0x20 << 24;
const F_NOT_DONE: u32 = 0x40 << 24;
const F_IN_PARTY: u32 = 0x80 << 24;
const F_ASKING: u32 = 0x0C << 24;

pub(crate) const SECTION_LEN: usize = 0x380;
const BLOCKS: usize = SECTION_LEN / 2;
/// Blocks requested per ask frame; kept under 256 so the 8-bit data-frame
/// position is unambiguous within the window.
const ASK_WINDOW: usize = 224;
/// Full-section re-requests tolerated after a checksum failure.
const TRANSFER_RETRIES: usize = 3;

// Section layout.
const OFF_COUNT: usize = 0x00;
const OFF_PARTY: usize = 0x04;
const OFF_MAIL: usize = 0x25C;
const MAIL_LEN: usize = 6 * 36;
const OFF_MAIL_SUM: usize = 0x374;
const OFF_PARTY_SUM: usize = 0x378;
const OFF_GLOBAL_SUM: usize = 0x37C;

// Menu values.
const SELECT_BASE: u8 = 0x80;
const SELECT_CANCEL: u8 = 0x8F;
const ACCEPT_1: u8 = 0xA2;
const DECLINE_1: u8 = 0xA1;
const ACCEPT_2: u8 = 0xB2;
const DECLINE_2: u8 = 0xB1;
/// The seven-round success sequence, in order.
const SUCCESS_SEQUENCE: [u8; 7] = [0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x9C];
const FAILURE: u8 = 0x9F;

/// Per-round success tags, `S3S1..S3S7`.
const SUCCESS_TAGS: [&[u8; 4]; 7] = [
    b"S3S1", b"S3S2", b"S3S3", b"S3S4", b"S3S5", b"S3S6", b"S3S7",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum G3Frame {
    Data { pos: u8, value: u16 },
    Ask { start: u16, end: u16 },
    Menu { value: u8 },
    Done,
    NotDone,
    Other,
}

fn data_frame(pos: u8, value: u16) -> u32 {
    F_SENDING | ((pos as u32) << 16) | value as u32
}

fn ask_frame(start: u16, end: u16) -> u32 {
    F_ASKING | ((end as u32 & 0xFFF) << 12) | (start as u32 & 0xFFF)
}

fn menu_frame(value: u8) -> u32 {
    F_IN_PARTY | F_DONE | value as u32
}

fn decode(word: u32) -> G3Frame {
    let control = word >> 24;
    if control & 0x0C == 0x0C {
        G3Frame::Ask {
            start: (word & 0xFFF) as u16,
            end: ((word >> 12) & 0xFFF) as u16,
        }
    } else if control & 0x10 != 0 {
        G3Frame::Data {
            pos: (word >> 16) as u8,
            value: word as u16,
        }
    } else if control & 0x80 != 0 {
        G3Frame::Menu { value: word as u8 }
    } else if control & 0x20 != 0 {
        G3Frame::Done
    } else if control & 0x40 != 0 {
        G3Frame::NotDone
    } else {
        G3Frame::Other
    }
}

fn words_sum(bytes: &[u8]) -> u32 {
    bytes
        .chunks_exact(4)
        .fold(0u32, |acc, c| {
            acc.wrapping_add(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        })
}

fn party_count(section: &[u8]) -> usize {
    (u32::from_le_bytes(section[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap()) as usize)
        .clamp(1, 6)
}

fn mail_sum(section: &[u8]) -> u32 {
    words_sum(&section[OFF_MAIL..OFF_MAIL + MAIL_LEN])
}

fn party_sum(section: &[u8]) -> u32 {
    let count = party_count(section);
    words_sum(&section[OFF_PARTY..OFF_PARTY + count * RECORD_LEN])
}

fn global_sum(section: &[u8]) -> u32 {
    words_sum(&section[..OFF_GLOBAL_SUM])
}

pub(crate) fn stamp_checksums(section: &mut [u8]) {
    let m = mail_sum(section);
    section[OFF_MAIL_SUM..OFF_MAIL_SUM + 4].copy_from_slice(&m.to_le_bytes());
    let p = party_sum(section);
    section[OFF_PARTY_SUM..OFF_PARTY_SUM + 4].copy_from_slice(&p.to_le_bytes());
    let g = global_sum(section);
    section[OFF_GLOBAL_SUM..OFF_GLOBAL_SUM + 4].copy_from_slice(&g.to_le_bytes());
}

fn validate_checksums(section: &[u8]) -> bool {
    let stored = |off: usize| u32::from_le_bytes(section[off..off + 4].try_into().unwrap());
    mail_sum(section) == stored(OFF_MAIL_SUM)
        && party_sum(section) == stored(OFF_PARTY_SUM)
        && global_sum(section) == stored(OFF_GLOBAL_SUM)
}

fn record_at(section: &[u8], slot: usize) -> &[u8] {
    &section[OFF_PARTY + slot * RECORD_LEN..OFF_PARTY + (slot + 1) * RECORD_LEN]
}

/// Post-trade mutation on a cached 0x380 section: remove `slot`, shift
/// the rest down, append `incoming` as the last member, restamp sums.
pub(crate) fn swap_with_last(section: &mut [u8], slot: usize, incoming: &[u8]) {
    debug_assert_eq!(incoming.len(), RECORD_LEN);
    let count = party_count(section);
    let last = count - 1;
    for i in slot..last {
        let (src_start, src_end) = (
            OFF_PARTY + (i + 1) * RECORD_LEN,
            OFF_PARTY + (i + 2) * RECORD_LEN,
        );
        let src: Vec<u8> = section[src_start..src_end].to_vec();
        section[OFF_PARTY + i * RECORD_LEN..OFF_PARTY + (i + 1) * RECORD_LEN]
            .copy_from_slice(&src);
        let mail_src: Vec<u8> =
            section[OFF_MAIL + (i + 1) * 36..OFF_MAIL + (i + 2) * 36].to_vec();
        section[OFF_MAIL + i * 36..OFF_MAIL + (i + 1) * 36].copy_from_slice(&mail_src);
    }
    section[OFF_PARTY + last * RECORD_LEN..OFF_PARTY + (last + 1) * RECORD_LEN]
        .copy_from_slice(incoming);
    for b in section[OFF_MAIL + last * 36..OFF_MAIL + (last + 1) * 36].iter_mut() {
        *b = 0;
    }
    stamp_checksums(section);
}

struct G3State {
    peer_section: Option<Vec<u8>>,
}

pub(crate) async fn run<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<(), AppError> {
    let mut state = G3State { peer_section: None };
    loop {
        m.check_stop()?;

        let peer_section = match (&m.target, state.peer_section.take()) {
            (TradeTarget::Pool, _) => build_pool_section(m).await?,
            (TradeTarget::Link, Some(cached)) => cached,
            (TradeTarget::Link, None) => {
                let blob = m
                    .relay
                    .pull(*b"FL3S", m.join_timeout)
                    .await
                    .ok_or(AppError::PeerTimeout(m.join_timeout.as_secs()))?;
                if blob.len() != SECTION_LEN {
                    return Err(AppError::Data(format!(
                        "peer section blob is {} bytes, expected {SECTION_LEN}",
                        blob.len()
                    )));
                }
                blob
            }
        };

        let flood = m.start_version_flood();
        let own_section = transfer_section(m, &peer_section).await;
        flood.stop();
        let own_section = own_section?;
        m.relay.send(*b"FL3S", &own_section)?;

        match menu_cycle(m, &mut state, &own_section, peer_section).await? {
            Some(()) => tracing::info!("gen 3 trade cycle complete, re-entering"),
            None => tracing::info!("gen 3 menu cancelled, re-entering"),
        }
    }
}

/// Build the peer section from the pool: graft the pool record onto the
/// bundled default section.
async fn build_pool_section<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<Vec<u8>, AppError> {
    let mut section = m
        .tables
        .default_pool_party
        .clone()
        .or_else(|| m.tables.default_party.clone())
        .ok_or_else(|| AppError::Data("base_pool.bin is required for pool trades".into()))?;
    section.resize(SECTION_LEN, 0);

    let raw = m
        .relay
        .pull(*b"P3SI", m.join_timeout)
        .await
        .ok_or(AppError::PeerTimeout(m.join_timeout.as_secs()))?;
    let mon = Pokemon3::from_bytes(&raw)
        .ok_or_else(|| AppError::Data(format!("pool record has bad length {}", raw.len())))?;
    if !mon.checksum_ok {
        tracing::warn!("pool record has a bad checksum; trading it anyway is refused");
    }
    tracing::info!(
        "pool offers {} (species {})",
        m.tables.name(mon.indexed_species()),
        mon.species()
    );

    section[OFF_COUNT..OFF_COUNT + 4].copy_from_slice(&1u32.to_le_bytes());
    section[OFF_PARTY..OFF_PARTY + RECORD_LEN].copy_from_slice(&mon.to_bytes());
    stamp_checksums(&mut section);
    Ok(section)
}

/// Bidirectional 896-byte section transfer over the 32-bit link: answer
/// the cartridge's ask frames from `outgoing` while filling our own
/// completion bitmap from its data frames. Done when every block is
/// present and all three checksums hold.
async fn transfer_section<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    outgoing: &[u8],
) -> Result<Vec<u8>, AppError> {
    let mut incoming = vec![0u8; SECTION_LEN];
    let mut have = vec![false; BLOCKS];
    let mut received = 0usize;
    let mut cart_done = false;
    let mut send_queue: VecDeque<usize> = VecDeque::new();
    let mut window_start = 0usize;
    let mut retries = 0usize;

    loop {
        m.check_stop()?;

        let out = if let Some(block) = send_queue.pop_front() {
            let value = u16::from_le_bytes([outgoing[block * 2], outgoing[block * 2 + 1]]);
            data_frame((block & 0xFF) as u8, value)
        } else if received < BLOCKS {
            window_start = have.iter().position(|&h| !h).unwrap_or(0);
            let end = (window_start + ASK_WINDOW).min(BLOCKS);
            ask_frame(window_start as u16, end as u16)
        } else {
            F_DONE
        };

        let word = m.link.exchange32(out)?;
        match decode(word) {
            G3Frame::Data { pos, value } => {
                let offset = pos.wrapping_sub((window_start & 0xFF) as u8) as usize;
                let block = window_start + offset;
                if offset < ASK_WINDOW && block < BLOCKS && !have[block] {
                    incoming[block * 2..block * 2 + 2].copy_from_slice(&value.to_le_bytes());
                    have[block] = true;
                    received += 1;
                    if received == BLOCKS && !validate_checksums(&incoming) {
                        retries += 1;
                        if retries > TRANSFER_RETRIES {
                            return Err(AppError::Data(
                                "section checksums failed after retries".into(),
                            ));
                        }
                        tracing::warn!("section checksums invalid, re-requesting all blocks");
                        have.fill(false);
                        received = 0;
                    }
                }
            }
            G3Frame::Ask { start, end } => {
                let (start, end) = (start as usize, (end as usize).min(BLOCKS));
                for block in start..end {
                    send_queue.push_back(block);
                }
            }
            G3Frame::Done => cart_done = true,
            G3Frame::NotDone => cart_done = false,
            G3Frame::Menu { .. } | G3Frame::Other => {}
        }

        if received == BLOCKS && cart_done && send_queue.is_empty() {
            let _ = m.link.exchange32(F_DONE)?;
            tracing::info!("gen 3 section transfer complete");
            return Ok(incoming);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Poll the cartridge's trade-menu frames until a value passing `accept`
/// repeats ten times in a row; cartridge glitches reset the streak.
async fn read_menu_stable<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    accept: impl Fn(u8) -> bool,
) -> Result<u8, AppError> {
    let mut last = None;
    let mut streak = 0;
    loop {
        m.check_stop()?;
        let word = m.link.exchange32(F_IN_PARTY | F_NOT_DONE)?;
        match decode(word) {
            G3Frame::Menu { value } if accept(value) => {
                if last == Some(value) {
                    streak += 1;
                    if streak >= 10 {
                        return Ok(value);
                    }
                } else {
                    last = Some(value);
                    streak = 1;
                }
            }
            _ => {
                last = None;
                streak = 0;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Press a peer event into the cartridge: repeat its menu frame a few
/// times so the game registers it through SPI noise.
async fn forward_menu<L: ByteLink>(m: &mut Mediator<'_, L>, value: u8) -> Result<(), AppError> {
    for _ in 0..10 {
        m.check_stop()?;
        let _ = m.link.exchange32(menu_frame(value))?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

fn is_selection(v: u8) -> bool {
    (SELECT_BASE..SELECT_BASE + 6).contains(&v)
}

/// Counter-tagged 3-byte little-endian event payload.
fn event_body(value: u8) -> [u8; 3] {
    [value, 0, 0]
}

async fn menu_cycle<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut G3State,
    own_section: &[u8],
    mut peer_section: Vec<u8>,
) -> Result<Option<()>, AppError> {
    // 1. Our selection.
    let own_sel = read_menu_stable(m, |v| is_selection(v) || v == SELECT_CANCEL).await?;
    if own_sel == SELECT_CANCEL {
        tracing::info!("we cancelled at the gen 3 menu");
        m.relay
            .send_with_counter(&mut m.seq, *b"CH3S", &event_body(SELECT_CANCEL))?;
        return Ok(None);
    }
    let own_slot = ((own_sel - SELECT_BASE) as usize).min(party_count(own_section) - 1);
    let own_record = record_at(own_section, own_slot).to_vec();
    let own_mon = Pokemon3::from_bytes(&own_record)
        .ok_or_else(|| AppError::Data("own record has bad length".into()))?;
    tracing::info!(
        "we offer slot {own_slot}: {}",
        m.tables.name(own_mon.indexed_species())
    );

    // 2. Broadcast selection plus the full record.
    let mut body = event_body(own_sel).to_vec();
    body.extend_from_slice(&own_record);
    m.relay.send_with_counter(&mut m.seq, *b"CH3S", &body)?;

    // 3. Peer selection.
    let frame = m.pull_event(*b"CH3S").await?;
    let peer_sel = frame.first().copied().unwrap_or(SELECT_CANCEL);
    if peer_sel == SELECT_CANCEL {
        tracing::info!("peer cancelled at the gen 3 menu");
        forward_menu(m, SELECT_CANCEL).await?;
        state.peer_section = Some(peer_section);
        return Ok(None);
    }
    let peer_record = frame.get(3..3 + RECORD_LEN).map(<[u8]>::to_vec);
    let peer_mon = peer_record.as_deref().and_then(Pokemon3::from_bytes);
    let peer_tradeable = peer_mon
        .as_ref()
        .is_some_and(|p| p.is_tradeable(m.tables));
    if let Some(p) = &peer_mon {
        tracing::info!(
            "peer offers {} \"{}\"",
            m.tables.name(p.indexed_species()),
            decode_field(p.nickname(), &m.tables.text_table, TERMINATOR_GEN3)
        );
        if !peer_tradeable {
            tracing::info!("peer record failed validation; declining this offer");
        }
    }
    forward_menu(m, peer_sel).await?;

    // 4. Two accept/decline rounds; an invalid peer record forces our
    // decline.
    for (tag, accept, decline) in [
        (b"A3S1", ACCEPT_1, DECLINE_1),
        (b"A3S2", ACCEPT_2, DECLINE_2),
    ] {
        let own_dec = if peer_tradeable {
            read_menu_stable(m, |v| v == accept || v == decline).await?
        } else {
            decline
        };
        m.relay
            .send_with_counter(&mut m.seq, *tag, &event_body(own_dec))?;
        let peer_dec = m
            .pull_event(*tag)
            .await?
            .first()
            .copied()
            .unwrap_or(decline);
        forward_menu(m, peer_dec).await?;
        if own_dec != accept || peer_dec != accept {
            tracing::info!("gen 3 trade declined");
            state.peer_section = Some(peer_section);
            if let Some(p) = &peer_mon {
                m.records.push(TradeRecord::new(
                    m.gen,
                    own_mon.indexed_species(),
                    p.indexed_species(),
                    TradeOutcome::Declined,
                ));
            }
            return Ok(None);
        }
    }

    // 5. Seven success rounds; 0x9F anywhere is failure.
    for (round, tag) in SUCCESS_TAGS.iter().enumerate() {
        let expected = SUCCESS_SEQUENCE[round];
        let own_suc = read_menu_stable(m, |v| v == expected || v == FAILURE).await?;
        m.relay
            .send_with_counter(&mut m.seq, **tag, &event_body(own_suc))?;
        let peer_suc = m
            .pull_event(**tag)
            .await?
            .first()
            .copied()
            .unwrap_or(FAILURE);
        if own_suc == FAILURE || peer_suc == FAILURE {
            tracing::warn!("gen 3 success sequence failed at round {round}");
            state.peer_section = Some(peer_section);
            return Ok(None);
        }
        forward_menu(m, peer_suc).await?;
    }

    // 6. Reproduce the peer's post-trade party locally.
    let peer_slot = ((peer_sel - SELECT_BASE) as usize).min(party_count(&peer_section) - 1);
    swap_with_last(&mut peer_section, peer_slot, &own_record);
    let received = peer_mon
        .as_ref()
        .map(|p| p.indexed_species())
        .unwrap_or_default();
    m.records.push(TradeRecord::new(
        m.gen,
        own_mon.indexed_species(),
        received,
        TradeOutcome::Completed,
    ));
    tracing::info!(
        "traded {} for {}",
        m.tables.name(own_mon.indexed_species()),
        m.tables.name(received)
    );

    if m.target == TradeTarget::Pool {
        m.relay.send(*b"P3SO", &own_record)?;
        if let Err(e) = m.relay.reconnect().await {
            tracing::warn!("pool reconnect failed: {e}");
        }
        state.peer_section = None;
    } else {
        state.peer_section = Some(peer_section);
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_codec_roundtrip() {
        assert_eq!(
            decode(data_frame(7, 0xBEEF)),
            G3Frame::Data {
                pos: 7,
                value: 0xBEEF
            }
        );
        assert_eq!(
            decode(ask_frame(224, 448)),
            G3Frame::Ask {
                start: 224,
                end: 448
            }
        );
        assert_eq!(decode(menu_frame(0x82)), G3Frame::Menu { value: 0x82 });
        assert_eq!(decode(F_DONE), G3Frame::Done);
        assert_eq!(decode(F_NOT_DONE), G3Frame::NotDone);
        assert_eq!(decode(0), G3Frame::Other);
    }

    #[test]
    fn test_ask_frame_has_asking_nybble() {
        let word = ask_frame(0, 224);
        assert_eq!((word >> 24) & 0x0C, 0x0C);
    }

    #[test]
    fn test_menu_frame_has_in_party_and_done() {
        let word = menu_frame(0x80);
        assert_eq!(word >> 24, 0xA0);
    }

    fn section_with_party(members: &[u8]) -> Vec<u8> {
        let mut section = vec![0u8; SECTION_LEN];
        section[OFF_COUNT..OFF_COUNT + 4]
            .copy_from_slice(&(members.len() as u32).to_le_bytes());
        for (i, &tag) in members.iter().enumerate() {
            let start = OFF_PARTY + i * RECORD_LEN;
            for b in section[start..start + RECORD_LEN].iter_mut() {
                *b = tag;
            }
        }
        stamp_checksums(&mut section);
        section
    }

    #[test]
    fn test_checksums_stamp_and_validate() {
        let mut section = section_with_party(&[1, 2]);
        assert!(validate_checksums(&section));
        section[OFF_PARTY] ^= 0xFF;
        assert!(!validate_checksums(&section));
        stamp_checksums(&mut section);
        assert!(validate_checksums(&section));
    }

    #[test]
    fn test_party_sum_is_keyed_on_count() {
        let mut a = section_with_party(&[1, 2]);
        // Garbage beyond the party count must not affect the party sum.
        a[OFF_PARTY + 3 * RECORD_LEN] = 0xAB;
        let before = party_sum(&a);
        a[OFF_PARTY + 3 * RECORD_LEN] = 0xCD;
        assert_eq!(party_sum(&a), before);
    }

    #[test]
    fn test_swap_with_last_shifts_and_appends() {
        let mut section = section_with_party(&[1, 2, 3]);
        let incoming = vec![9u8; RECORD_LEN];
        swap_with_last(&mut section, 0, &incoming);
        assert_eq!(record_at(&section, 0)[0], 2);
        assert_eq!(record_at(&section, 1)[0], 3);
        assert_eq!(record_at(&section, 2)[0], 9);
        assert_eq!(party_count(&section), 3);
        assert!(validate_checksums(&section));
    }

    #[test]
    fn test_swap_with_last_single_member() {
        let mut section = section_with_party(&[5]);
        let incoming = vec![7u8; RECORD_LEN];
        swap_with_last(&mut section, 0, &incoming);
        assert_eq!(record_at(&section, 0)[0], 7);
        assert!(validate_checksums(&section));
    }

    mod transfer {
        use super::*;
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        use crate::data::StaticTables;
        use crate::link::testing::ScriptedLink;
        use crate::relay::RelayClient;
        use crate::types::{Generation, TradeMode};

        #[tokio::test]
        async fn test_transfer_collects_cart_section_in_order() {
            let cart_section = section_with_party(&[4, 5, 6]);
            // The cartridge streams every block in order, then reports
            // done. It never asks for our data in this script.
            let mut replies: Vec<u32> = (0..BLOCKS)
                .map(|k| {
                    let value =
                        u16::from_le_bytes([cart_section[k * 2], cart_section[k * 2 + 1]]);
                    data_frame((k & 0xFF) as u8, value)
                })
                .collect();
            replies.extend([F_DONE; 4]);

            let mut link = ScriptedLink::new32(replies);
            let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
            let tables = StaticTables::empty(Generation::Three);
            let mut m = Mediator::new(
                &mut link,
                &relay,
                &tables,
                false,
                Generation::Three,
                TradeMode::Buffered,
                TradeTarget::Link,
                false,
                Arc::new(AtomicBool::new(false)),
            );

            let outgoing = section_with_party(&[9]);
            let got = transfer_section(&mut m, &outgoing).await.unwrap();
            assert_eq!(got, cart_section);
        }
    }
}
