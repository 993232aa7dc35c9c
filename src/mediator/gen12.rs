use std::time::Duration;

use super::{Mediator, FILLER};
use crate::data::text::{decode_field, TERMINATOR_GEN12};
use crate::error::AppError;
use crate::exchange::SectionExchanger;
use crate::link::ByteLink;
use crate::party::gen12::{
    self, international_to_japanese, japanese_to_international, translate_mail, PartySection,
    SinglePokemon, MAIL_TEXT_REGION, SEC_MAIL, SEC_PARTY, SEC_PATCH, SEC_RANDOM,
};
use crate::party::patch::{apply_patches, encode_patches};
use crate::types::{Generation, TradeMode, TradeOutcome, TradeRecord, TradeTarget};

/// `ASK` payload bytes: the sender needs move data / does not.
const ASK_NEED: u8 = 0x72;
const ASK_NONE: u8 = 0x43;

/// Patch data starts a few bytes into the patch section.
const PATCH_DATA_OFF: usize = 7;

/// How long to wait for the optional pool random-template.
const RAN_TIMEOUT: Duration = Duration::from_secs(5);

struct MenuBytes {
    select_base: u8,
    cancel: u8,
    accept: u8,
    decline: u8,
    end: u8,
}

fn menu_bytes(gen: Generation) -> MenuBytes {
    match gen {
        Generation::One => MenuBytes {
            select_base: 0x60,
            cancel: 0x6F,
            accept: 0x62,
            decline: 0x61,
            end: 0x6F,
        },
        _ => MenuBytes {
            select_base: 0x70,
            cancel: 0x7F,
            accept: 0x72,
            decline: 0x71,
            end: 0x7F,
        },
    }
}

fn is_selection(b: u8, m: &MenuBytes) -> bool {
    (m.select_base..m.select_base + 6).contains(&b)
}

fn is_success(b: u8) -> bool {
    (0x90..=0x9F).contains(&b)
}

fn enter_steps(gen: Generation) -> [(u8, &'static [u8]); 5] {
    match gen {
        Generation::One => [
            (0x01, &[0x60]),
            (0x60, &[0xD0]),
            (0xD0, &[0x00]),
            (0x00, &[0xFE]),
            (0xFE, &[0xFE]),
        ],
        _ => [
            (0x01, &[0x61]),
            (0x61, &[0xD1]),
            (0xD1, &[0x00]),
            (0x00, &[0xFE]),
            (0xFE, &[0xFE]),
        ],
    }
}

fn sit_steps(gen: Generation) -> [(u8, &'static [u8]); 3] {
    match gen {
        Generation::One => [(0x65, &[0x65]), (0x65, &[0x00]), (0x66, &[0xFD])],
        _ => [(0x75, &[0x75]), (0x75, &[0x00]), (0x76, &[0xFD])],
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Traded,
    Cancelled,
}

/// Session-long Gen 1/2 state: the cached peer data (logical form, 0xFE
/// restored), the latest own sections, and the MVS bookkeeping flags.
pub(crate) struct SessionState {
    gen: Generation,
    peer_random: Vec<u8>,
    peer_party: Vec<u8>,
    peer_mail: Vec<u8>,
    have_peer: bool,
    ghost: bool,
    own_wire: Vec<Vec<u8>>,
    own_party: Vec<u8>,
    own_mail: Vec<u8>,
    expect_mvs_in: bool,
    owe_mvs_out: bool,
    subsequent: bool,
}

impl SessionState {
    pub(crate) fn new(gen: Generation) -> Self {
        let lengths = gen.section_lengths();
        Self {
            gen,
            peer_random: vec![0; lengths[SEC_RANDOM]],
            peer_party: vec![0; lengths[SEC_PARTY]],
            peer_mail: lengths.get(SEC_MAIL).map(|&l| vec![0; l]).unwrap_or_default(),
            have_peer: false,
            ghost: false,
            own_wire: lengths.iter().map(|&l| vec![0; l]).collect(),
            own_party: vec![0; lengths[SEC_PARTY]],
            own_mail: lengths.get(SEC_MAIL).map(|&l| vec![0; l]).unwrap_or_default(),
            expect_mvs_in: false,
            owe_mvs_out: false,
            subsequent: false,
        }
    }

    fn peer_party_section(&self) -> PartySection {
        PartySection::new(self.gen, self.peer_party.clone())
    }

    fn own_party_section(&self) -> PartySection {
        PartySection::new(self.gen, self.own_party.clone())
    }
}

fn split_sections(gen: Generation, blob: &[u8]) -> Result<Vec<Vec<u8>>, AppError> {
    let lengths = gen.section_lengths();
    let total: usize = lengths.iter().sum();
    if blob.len() < total {
        return Err(AppError::Data(format!(
            "section blob is {} bytes, expected {total}",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(lengths.len());
    let mut off = 0;
    for &len in lengths {
        out.push(blob[off..off + len].to_vec());
        off += len;
    }
    Ok(out)
}

/// Restore a wire-form party section to logical form using its patch
/// section.
fn party_to_logical(gen: Generation, party: &mut [u8], patch_section: &[u8]) {
    let records = gen12::layout(gen).records;
    apply_patches(&mut party[records..], &patch_section[PATCH_DATA_OFF..]);
}

/// Escape a logical party section for the wire, returning the rebuilt
/// patch section alongside.
fn party_to_wire(gen: Generation, logical: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let records = gen12::layout(gen).records;
    let mut party = logical.to_vec();
    let patches = encode_patches(&mut party[records..]);
    let len = gen.section_lengths()[SEC_PATCH];
    let mut section = vec![0u8; len];
    let n = patches.len().min(len - PATCH_DATA_OFF);
    section[PATCH_DATA_OFF..PATCH_DATA_OFF + n].copy_from_slice(&patches[..n]);
    (party, section)
}

/// Restore a wire-form mail section in place (the patch list lives in its
/// tail).
fn mail_to_logical(mail: &mut [u8]) {
    let (text, patches) = mail.split_at_mut(MAIL_TEXT_REGION);
    apply_patches(text, patches);
}

fn mail_to_wire(logical: &[u8]) -> Vec<u8> {
    let mut mail = logical.to_vec();
    let patches = {
        let text = &mut mail[..MAIL_TEXT_REGION];
        encode_patches(text)
    };
    let tail = mail.len() - MAIL_TEXT_REGION;
    let n = patches.len().min(tail);
    mail[MAIL_TEXT_REGION..MAIL_TEXT_REGION + n].copy_from_slice(&patches[..n]);
    for b in mail[MAIL_TEXT_REGION + n..].iter_mut() {
        *b = 0;
    }
    mail
}

pub(crate) async fn run<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<(), AppError> {
    let mut state = SessionState::new(m.gen);
    loop {
        m.check_stop()?;
        enter_room(m).await?;
        sit_at_table(m).await?;
        if state.subsequent {
            subsequent_sequence(m, &mut state).await?;
        } else {
            starting_sequence(m, &mut state).await?;
        }
        match menu_loop(m, &mut state).await? {
            Outcome::Traded => {
                tracing::info!("trade cycle complete, re-entering");
            }
            Outcome::Cancelled => {
                end_trade(m).await?;
                state.subsequent = false;
                state.expect_mvs_in = false;
                state.owe_mvs_out = false;
                tracing::info!("menu cancelled, back to the table");
            }
        }
    }
}

async fn enter_room<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<(), AppError> {
    tracing::info!("entering the cable club");
    m.handshake(&enter_steps(m.gen)).await
}

async fn sit_at_table<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<(), AppError> {
    tracing::info!("sitting at the trade table");
    m.handshake(&sit_steps(m.gen)).await
}

async fn end_trade<L: ByteLink>(m: &mut Mediator<'_, L>) -> Result<(), AppError> {
    let b = menu_bytes(m.gen);
    m.drain_until(b.end, b.end, 1).await?;
    m.drain_until(b.end, 0x00, 1).await
}

/// Full starting sequence: version/random exchange, then all sections.
async fn starting_sequence<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let flood = m.start_version_flood();
    let result = starting_sequence_inner(m, state).await;
    flood.stop();
    result
}

async fn starting_sequence_inner<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    if m.mode == TradeMode::Buffered && !state.have_peer {
        match m.target {
            TradeTarget::Pool => pool_setup(m, state).await?,
            TradeTarget::Link => ghost_setup(m, state)?,
        }
    }

    // Cached peer data (kept current by the post-trade mutation) replaces
    // per-byte sync on re-entry, whatever the session mode.
    if m.mode == TradeMode::Buffered || state.have_peer {
        feed_sections_buffered(m, state).await?;
    } else {
        exchange_sections_sync(m, state).await?;
    }

    // Publish our sections as one buffered blob; the peer pulls it when
    // it needs a full resync.
    let blob: Vec<u8> = state.own_wire.concat();
    m.relay.send(m.gen.tag("FLL"), &blob)?;
    Ok(())
}

/// Construct the peer side from the server pool: pull the pool Pokémon
/// and graft it onto the bundled default party.
async fn pool_setup<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let template = m
        .tables
        .default_party
        .clone()
        .ok_or_else(|| AppError::Data("base.bin is required for pool trades".into()))?;
    let mut sections = split_sections(m.gen, &template)?;

    let mut raw = m
        .relay
        .pull(m.gen.tag("POL"), m.join_timeout)
        .await
        .ok_or(AppError::PeerTimeout(m.join_timeout.as_secs()))?;
    m.sanitizer.clean_single_pokemon(&mut raw);
    let mon = SinglePokemon::from_bytes(m.gen, &raw)
        .ok_or_else(|| AppError::Data(format!("pool record has bad length {}", raw.len())))?;
    tracing::info!(
        "pool offers {} (species 0x{:02X})",
        m.tables.name(mon.species() as u16),
        mon.species()
    );

    // The template party arrives in wire form; work on it logically.
    let patch_section = sections[SEC_PATCH].clone();
    party_to_logical(m.gen, &mut sections[SEC_PARTY], &patch_section);
    let mut party = PartySection::new(m.gen, std::mem::take(&mut sections[SEC_PARTY]));
    party.set_count(1);
    party.insert_single(0, &mon);
    if pool_record_is_egg(m.gen, &mon) {
        party.make_last_egg(&m.tables.egg_nick);
        tracing::info!("pool pokemon arrives as an egg");
    }
    state.peer_party = party.into_bytes();

    state.peer_random = match m.relay.pull(m.gen.tag("RAN"), RAN_TIMEOUT).await {
        Some(mut ran) => {
            ran.resize(m.gen.section_lengths()[SEC_RANDOM], 0);
            ran
        }
        None => m.tables.base_random_section.clone(),
    };

    if m.gen == Generation::Two {
        let mut mail = m.tables.no_mail_section.clone();
        mail.resize(m.gen.section_lengths()[SEC_MAIL], 0);
        mail_to_logical(&mut mail);
        if mon.mail.iter().any(|&b| b != 0) {
            mail[..gen12::MAIL_MSG_LEN].copy_from_slice(&mon.mail[..gen12::MAIL_MSG_LEN]);
            let meta = 6 * gen12::MAIL_MSG_LEN;
            mail[meta..meta + gen12::MAIL_META_LEN]
                .copy_from_slice(&mon.mail[gen12::MAIL_MSG_LEN..]);
        }
        state.peer_mail = mail;
    }

    state.have_peer = true;
    Ok(())
}

/// Pool convention: an egg is flagged by the high bit of the hatch-cycles
/// byte.
fn pool_record_is_egg(gen: Generation, mon: &SinglePokemon) -> bool {
    match gen12::layout(gen).cycles_off {
        Some(off) => mon.core.get(off).is_some_and(|&b| b & 0x80 != 0),
        None => false,
    }
}

/// First buffered cycle with no peer data: stage the bundled default
/// party as ghost data. The menu pass cancels in-game while the real
/// peer payload arrives.
fn ghost_setup<L: ByteLink>(
    m: &Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let template = m
        .tables
        .default_party
        .clone()
        .ok_or_else(|| AppError::Data("base.bin is required for buffered link trades".into()))?;
    let mut sections = split_sections(m.gen, &template)?;
    let patch_section = sections[SEC_PATCH].clone();
    party_to_logical(m.gen, &mut sections[SEC_PARTY], &patch_section);
    state.peer_random = std::mem::take(&mut sections[SEC_RANDOM]);
    state.peer_party = std::mem::take(&mut sections[SEC_PARTY]);
    if m.gen == Generation::Two {
        let mut mail = std::mem::take(&mut sections[SEC_MAIL]);
        mail_to_logical(&mut mail);
        state.peer_mail = mail;
    }
    state.ghost = true;
    tracing::info!("no peer data yet: staging ghost party");
    Ok(())
}

/// Escape a logical party section for a Japanese cartridge: narrow the
/// text fields first, then record patch offsets against the Japanese
/// layout the cartridge will parse.
fn party_to_wire_japanese(gen: Generation, logical: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut party = international_to_japanese(logical, gen);
    let records = gen12::japanese_records_offset(gen);
    let patches = encode_patches(&mut party[records..]);
    let len = gen.section_lengths()[SEC_PATCH];
    let mut section = vec![0u8; len];
    let n = patches.len().min(len - PATCH_DATA_OFF);
    section[PATCH_DATA_OFF..PATCH_DATA_OFF + n].copy_from_slice(&patches[..n]);
    (party, section)
}

/// Build the wire-form feed for one cached peer section.
fn build_feed<L: ByteLink>(
    m: &Mediator<'_, L>,
    state: &SessionState,
    index: usize,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let japanese = m.japanese && m.tables.japanese_tables_present();
    match index {
        SEC_RANDOM => (state.peer_random.clone(), None),
        SEC_PARTY => {
            let (party, patch_section) = if japanese {
                party_to_wire_japanese(m.gen, &state.peer_party)
            } else {
                party_to_wire(m.gen, &state.peer_party)
            };
            (party, Some(patch_section))
        }
        SEC_MAIL => {
            let mut mail = state.peer_mail.clone();
            if japanese {
                if let Some(table) = &m.tables.mail_en_to_jp {
                    translate_mail(&mut mail, table);
                }
            }
            (mail_to_wire(&mail), None)
        }
        _ => (Vec::new(), None),
    }
}

/// Feed all cached peer sections to the cartridge with no per-byte peer
/// I/O, collecting our own sections along the way.
async fn feed_sections_buffered<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let lengths = m.gen.section_lengths().to_vec();
    let mut patch_feed: Option<Vec<u8>> = None;

    for index in 0..lengths.len() {
        let feed = match index {
            SEC_PATCH => patch_feed
                .take()
                .unwrap_or_else(|| vec![0; lengths[SEC_PATCH]]),
            _ => {
                let (feed, patch) = build_feed(m, state, index);
                if let Some(p) = patch {
                    patch_feed = Some(p);
                }
                feed
            }
        };

        let own = {
            let stop = std::sync::Arc::clone(&m.stop);
            let mut ex = SectionExchanger::new(&mut *m.link, m.relay, m.gen, &stop);
            ex.exchange_buffered(index, &feed).await?
        };
        state.own_wire[index] = own;
    }
    finish_own_sections(m, state);
    Ok(())
}

/// Interleaved exchange of all sections with the peer, with the
/// mail-section shortcut when neither party carries mail.
async fn exchange_sections_sync<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let lengths = m.gen.section_lengths().to_vec();
    let mut peer_wire: Vec<Vec<u8>> = Vec::with_capacity(lengths.len());

    for (index, &len) in lengths.iter().enumerate() {
        if index == SEC_MAIL {
            let own_party = PartySection::new(m.gen, state.own_wire[SEC_PARTY].clone());
            let peer_party = PartySection::new(m.gen, peer_wire[SEC_PARTY].clone());
            if !own_party.has_mail() && !peer_party.has_mail() {
                tracing::info!("no mail on either side, skipping mail sync");
                let mut feed = m.tables.no_mail_section.clone();
                feed.resize(len, 0);
                let own = {
                    let stop = std::sync::Arc::clone(&m.stop);
                    let mut ex = SectionExchanger::new(&mut *m.link, m.relay, m.gen, &stop);
                    ex.exchange_buffered(index, &feed).await?
                };
                state.own_wire[index] = own;
                peer_wire.push(feed);
                continue;
            }
        }
        let (own, peer) = {
            let stop = std::sync::Arc::clone(&m.stop);
            let mut ex = SectionExchanger::new(&mut *m.link, m.relay, m.gen, &stop);
            ex.exchange_sync(index, len).await?
        };
        state.own_wire[index] = own;
        peer_wire.push(peer);
    }

    adopt_peer_sections(m, state, peer_wire);
    finish_own_sections(m, state);
    Ok(())
}

/// Sanitize received peer wire sections and cache them in logical form.
fn adopt_peer_sections<L: ByteLink>(
    m: &Mediator<'_, L>,
    state: &mut SessionState,
    mut wire: Vec<Vec<u8>>,
) {
    for (index, section) in wire.iter_mut().enumerate() {
        m.sanitizer.clean_section(index, section);
    }
    state.peer_random = std::mem::take(&mut wire[SEC_RANDOM]);
    let mut party = std::mem::take(&mut wire[SEC_PARTY]);
    party_to_logical(m.gen, &mut party, &wire[SEC_PATCH]);
    state.peer_party = party;
    if m.gen == Generation::Two {
        let mut mail = std::mem::take(&mut wire[SEC_MAIL]);
        mail_to_logical(&mut mail);
        if m.japanese {
            if let Some(table) = &m.tables.mail_jp_to_en {
                translate_mail(&mut mail, table);
            }
        }
        state.peer_mail = mail;
    }
    state.have_peer = true;
}

/// Derive the logical own party/mail once all own sections are in. A
/// Japanese cartridge's party section is restored against the Japanese
/// layout, widened, and re-escaped so the published wire form is always
/// International.
fn finish_own_sections<L: ByteLink>(m: &Mediator<'_, L>, state: &mut SessionState) {
    let japanese = m.japanese && m.tables.japanese_tables_present();
    if japanese {
        let mut jp = state.own_wire[SEC_PARTY].clone();
        let records = gen12::japanese_records_offset(m.gen);
        apply_patches(
            &mut jp[records..],
            &state.own_wire[SEC_PATCH][PATCH_DATA_OFF..],
        );
        state.own_party = japanese_to_international(&jp, m.gen);
        let (wire, patch_section) = party_to_wire(m.gen, &state.own_party);
        state.own_wire[SEC_PARTY] = wire;
        state.own_wire[SEC_PATCH] = patch_section;
    } else {
        let mut party = state.own_wire[SEC_PARTY].clone();
        party_to_logical(m.gen, &mut party, &state.own_wire[SEC_PATCH]);
        state.own_party = party;
    }
    if m.gen == Generation::Two {
        let mut mail = state.own_wire[SEC_MAIL].clone();
        mail_to_logical(&mut mail);
        if japanese {
            if let Some(table) = &m.tables.mail_jp_to_en {
                translate_mail(&mut mail, table);
            }
        }
        state.own_mail = mail;
    }
}

/// Post-success re-entry path: peer MVS in, buffered sections from
/// cache, our MVS out.
async fn subsequent_sequence<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let flood = m.start_version_flood();
    let result = subsequent_sequence_inner(m, state).await;
    flood.stop();
    result
}

async fn subsequent_sequence_inner<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<(), AppError> {
    let mvs_tag = m.gen.tag("MVS");
    if state.expect_mvs_in {
        // A missing refresh leaves the cached moves stale but is not
        // fatal; the peer may itself be waiting on our sections first.
        let timeout = m.join_timeout;
        match m
            .relay
            .pull_with_counter(&mut m.seq, mvs_tag, timeout)
            .await
        {
            Some(mut body) => {
                m.sanitizer.clean_moves(&mut body);
                if body.len() >= 8 {
                    let moves: [u8; 4] = body[0..4].try_into().unwrap();
                    let pps: [u8; 4] = body[4..8].try_into().unwrap();
                    let mut party = state.peer_party_section();
                    party.set_last_moves(&moves, &pps);
                    state.peer_party = party.into_bytes();
                    tracing::info!("applied peer move refresh {moves:02X?}");
                } else {
                    tracing::warn!("short MVS payload ({} bytes) ignored", body.len());
                }
            }
            None => tracing::warn!("peer move refresh never arrived; keeping cached moves"),
        }
    }

    feed_sections_buffered(m, state).await?;

    if state.owe_mvs_out {
        let party = state.own_party_section();
        let last = party.count() - 1;
        let l = gen12::layout(m.gen);
        let core = party.core_at(last);
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&core[l.moves_off..l.moves_off + 4]);
        body[4..8].copy_from_slice(&core[l.pp_off..l.pp_off + 4]);
        m.relay.send_with_counter(&mut m.seq, mvs_tag, &body)?;
        tracing::info!("sent move refresh for our evolved slot");
    }

    state.expect_mvs_in = false;
    state.owe_mvs_out = false;
    state.subsequent = false;
    Ok(())
}

/// The trade-menu loop: selection, offer, accept, success. Repeats on
/// declines; returns on a completed trade or a cancellation.
async fn menu_loop<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<Outcome, AppError> {
    if state.ghost {
        return ghost_cancel(m, state).await;
    }
    let b = menu_bytes(m.gen);
    let chc_tag = m.gen.tag("CHC");
    let acp_tag = m.gen.tag("ACP");
    let suc_tag = m.gen.tag("SUC");
    let ask_tag = m.gen.tag("ASK");

    loop {
        m.check_stop()?;

        // 1. Our selection, debounced against cartridge glitches.
        let own_sel = m
            .read_stable(FILLER, |x| is_selection(x, &b) || x == b.cancel)
            .await?;
        if own_sel == b.cancel {
            tracing::info!("we cancelled at the menu");
            m.relay.send_with_counter(&mut m.seq, chc_tag, &[b.cancel])?;
            return Ok(Outcome::Cancelled);
        }
        let own_slot = (own_sel - b.select_base) as usize;
        let own_mon = state
            .own_party_section()
            .extract_single(own_slot, Some(&state.own_mail));
        tracing::info!(
            "we offer slot {own_slot}: {}",
            m.tables.name(own_mon.species() as u16)
        );

        // 2. Broadcast our choice with the full record attached.
        let mut body = vec![own_sel];
        body.extend_from_slice(&own_mon.to_bytes());
        m.relay.send_with_counter(&mut m.seq, chc_tag, &body)?;

        // 3. Peer choice.
        let frame = m.pull_event(chc_tag).await?;
        let peer_sel = frame.first().copied().unwrap_or(b.cancel);
        if peer_sel == b.cancel {
            tracing::info!("peer cancelled at the menu");
            self_forward(m, peer_sel).await?;
            return Ok(Outcome::Cancelled);
        }
        let mut peer_raw = frame[1..].to_vec();
        m.sanitizer.clean_single_pokemon(&mut peer_raw);
        let Some(peer_mon) = SinglePokemon::from_bytes(m.gen, &peer_raw) else {
            tracing::warn!("malformed peer choice ({} bytes), waiting again", peer_raw.len());
            continue;
        };
        let peer_slot = (peer_sel.wrapping_sub(b.select_base) as usize)
            .min(state.peer_party_section().count() - 1);
        tracing::info!(
            "peer offers slot {peer_slot}: {} \"{}\"",
            m.tables.name(peer_mon.species() as u16),
            decode_field(&peer_mon.nick, &m.tables.text_table, TERMINATOR_GEN12)
        );

        // 4. Forward the peer's selection to the cartridge.
        self_forward(m, peer_sel).await?;

        // 5. Accept/decline, ours then theirs.
        let own_dec = m
            .read_stable(FILLER, |x| x == b.accept || x == b.decline)
            .await?;
        m.relay.send_with_counter(&mut m.seq, acp_tag, &[own_dec])?;
        let peer_dec = m
            .pull_event(acp_tag)
            .await?
            .first()
            .copied()
            .unwrap_or(b.decline);
        self_forward(m, peer_dec).await?;

        if own_dec != b.accept || peer_dec != b.accept {
            tracing::info!("trade declined (us: 0x{own_dec:02X}, peer: 0x{peer_dec:02X})");
            m.records.push(TradeRecord::new(
                m.gen,
                own_mon.species() as u16,
                peer_mon.species() as u16,
                TradeOutcome::Declined,
            ));
            continue;
        }

        // 6. Success round: wait for the cartridge's success byte (a new
        // selection byte counts as implicit success), exchange it, echo
        // it back.
        let success = m
            .read_stable(FILLER, |x| is_success(x) || is_selection(x, &b))
            .await?;
        m.relay.send_with_counter(&mut m.seq, suc_tag, &[success])?;
        let _ = m.pull_event(suc_tag).await?;
        m.link_echo_success(success).await?;

        // 7. Reproduce the peer's post-trade party locally: their slot
        // leaves, our Pokémon takes the last slot.
        let mut peer_party = state.peer_party_section();
        peer_party.swap_with_last(peer_slot, &own_mon);
        state.peer_party = peer_party.into_bytes();

        // 8. Need-data exchange for trade evolutions/move learns.
        let sent_special = m.tables.is_special_mon(own_mon.species());
        let ask = if sent_special { ASK_NEED } else { ASK_NONE };
        m.relay.send_with_counter(&mut m.seq, ask_tag, &[ask])?;
        let peer_ask = m
            .pull_event(ask_tag)
            .await?
            .first()
            .copied()
            .unwrap_or(ASK_NONE);
        state.expect_mvs_in = sent_special;
        state.owe_mvs_out = peer_ask == ASK_NEED;
        state.subsequent = state.expect_mvs_in || state.owe_mvs_out;

        m.records.push(TradeRecord::new(
            m.gen,
            own_mon.species() as u16,
            peer_mon.species() as u16,
            TradeOutcome::Completed,
        ));
        tracing::info!(
            "traded {} for {}",
            m.tables.name(own_mon.species() as u16),
            m.tables.name(peer_mon.species() as u16)
        );

        if m.target == TradeTarget::Pool {
            pool_after_trade(m, state, &own_mon).await?;
        }
        return Ok(Outcome::Traded);
    }
}

/// Forward a peer byte to the cartridge, then drain to ack and ready.
async fn self_forward<L: ByteLink>(m: &mut Mediator<'_, L>, byte: u8) -> Result<(), AppError> {
    m.link.exchange(byte)?;
    m.drain_until(byte, 0x00, 1).await?;
    m.drain_until(FILLER, 0xFE, 1).await
}

impl<'a, L: ByteLink> Mediator<'a, L> {
    /// Echo the success byte back and drain until the cartridge settles.
    async fn link_echo_success(&mut self, success: u8) -> Result<(), AppError> {
        self.link.exchange(success)?;
        self.drain_until(success, 0x00, 1).await?;
        self.drain_until(FILLER, 0xFE, 5).await
    }
}

/// Ghost-trade epilogue: let the player pick anything, answer with the
/// in-game "no thanks", and collect the real peer payload meanwhile.
async fn ghost_cancel<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
) -> Result<Outcome, AppError> {
    let b = menu_bytes(m.gen);
    let _ = m
        .read_stable(FILLER, |x| is_selection(x, &b) || x == b.cancel)
        .await?;
    self_forward(m, b.cancel).await?;

    let blob = m
        .relay
        .pull(m.gen.tag("FLL"), m.join_timeout)
        .await
        .ok_or(AppError::PeerTimeout(m.join_timeout.as_secs()))?;
    let wire = split_sections(m.gen, &blob)?;
    adopt_peer_sections(m, state, wire);
    state.ghost = false;
    tracing::info!("ghost trade cancelled; real peer data cached");
    Ok(Outcome::Cancelled)
}

/// Pool epilogue: hand our Pokémon to the pool and reconnect so the
/// server deals a fresh one next cycle.
async fn pool_after_trade<L: ByteLink>(
    m: &mut Mediator<'_, L>,
    state: &mut SessionState,
    own_mon: &SinglePokemon,
) -> Result<(), AppError> {
    m.relay.send(m.gen.tag("POL"), &own_mon.to_bytes())?;
    if let Err(e) = m.relay.reconnect().await {
        tracing::warn!("pool reconnect failed: {e}");
    }
    state.have_peer = false;
    state.subsequent = false;
    state.expect_mvs_in = false;
    state.owe_mvs_out = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use crate::data::StaticTables;
    use crate::link::testing::ScriptedLink;
    use crate::relay::{Frame, RelayClient};

    fn mon(tag: u8, species: u8) -> SinglePokemon {
        let l = gen12::layout(Generation::Two);
        let mut core = vec![tag; l.record_len];
        core[0] = species;
        SinglePokemon {
            core,
            ot: vec![0x80; l.text_len],
            nick: vec![0x81; l.text_len],
            mail: vec![0; gen12::MAIL_MSG_LEN + gen12::MAIL_META_LEN],
        }
    }

    fn party_bytes(members: &[(u8, u8)]) -> Vec<u8> {
        let len = Generation::Two.section_lengths()[SEC_PARTY];
        let mut party = PartySection::new(Generation::Two, vec![0u8; len]);
        party.set_count(members.len());
        for (slot, &(tag, species)) in members.iter().enumerate() {
            party.insert_single(slot, &mon(tag, species));
        }
        party.into_bytes()
    }

    fn inject_counter_tagged(relay: &RelayClient, tag: &[u8; 4], counter: u8, body: &[u8]) {
        let mut payload = vec![counter];
        payload.extend_from_slice(body);
        relay.inject(
            &Frame::Set {
                tag: *tag,
                payload,
            }
            .encode(),
        );
    }

    fn menu_cycle_replies() -> Vec<u8> {
        let mut r = Vec::new();
        r.extend(vec![0x70; 10]); // our selection
        r.extend([0x00, 0x00, 0xFE]); // forward peer selection
        r.extend(vec![0x72; 10]); // our accept
        r.extend([0x00, 0x00, 0xFE]); // forward peer accept
        r.extend(vec![0x91; 10]); // success byte
        r.extend([0x00, 0x00]); // echo + ack
        r.extend(vec![0xFE; 5]); // settle
        r
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
            TradeMode::Buffered,
            TradeTarget::Link,
            false,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_menu_cycle_completes_a_trade() {
        let mut link = ScriptedLink::new(menu_cycle_replies());
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let tables = StaticTables::empty(Generation::Two);
        let mut m = mediator(&mut link, &relay, &tables);

        let mut state = SessionState::new(Generation::Two);
        state.have_peer = true;
        state.own_party = party_bytes(&[(0x01, 0x19), (0x02, 0x20)]);
        state.peer_party = party_bytes(&[(0x03, 0x2A)]);

        // The peer offers its slot 0 with the full record attached, then
        // accepts, reports success, and needs no move data.
        let peer = mon(0x03, 0x2A);
        let mut chc = vec![0x70];
        chc.extend_from_slice(&peer.to_bytes());
        inject_counter_tagged(&relay, b"CHC2", 5, &chc);
        inject_counter_tagged(&relay, b"ACP2", 6, &[0x72]);
        inject_counter_tagged(&relay, b"SUC2", 7, &[0x91]);
        inject_counter_tagged(&relay, b"ASK2", 8, &[ASK_NONE]);

        let outcome = menu_loop(&mut m, &mut state).await.unwrap();
        assert_eq!(outcome, Outcome::Traded);

        // The cached peer party now holds our traded Pokémon in its last
        // slot.
        let peer_party = state.peer_party_section();
        assert_eq!(peer_party.count(), 1);
        assert_eq!(peer_party.species_at(0), 0x19);
        assert!(!state.expect_mvs_in);
        assert!(!state.owe_mvs_out);
        assert!(!state.subsequent);
        assert_eq!(m.records.len(), 1);
        assert_eq!(m.records[0].outcome, TradeOutcome::Completed);
        assert_eq!(m.records[0].sent_species, 0x19);
        assert_eq!(m.records[0].received_species, 0x2A);
    }

    #[tokio::test]
    async fn test_menu_cycle_special_mon_sets_mvs_flags() {
        let mut link = ScriptedLink::new(menu_cycle_replies());
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let mut tables = StaticTables::empty(Generation::Two);
        tables.special_mons = crate::data::tables::IdBitmap::from_byte_list(&[0xF9]);
        let mut m = mediator(&mut link, &relay, &tables);

        let mut state = SessionState::new(Generation::Two);
        state.have_peer = true;
        // We send away Lugia (0xF9), a special mon.
        state.own_party = party_bytes(&[(0x01, 0xF9)]);
        state.peer_party = party_bytes(&[(0x03, 0x2A)]);

        let peer = mon(0x03, 0x2A);
        let mut chc = vec![0x70];
        chc.extend_from_slice(&peer.to_bytes());
        inject_counter_tagged(&relay, b"CHC2", 20, &chc);
        inject_counter_tagged(&relay, b"ACP2", 21, &[0x72]);
        inject_counter_tagged(&relay, b"SUC2", 22, &[0x91]);
        inject_counter_tagged(&relay, b"ASK2", 23, &[ASK_NEED]);

        let outcome = menu_loop(&mut m, &mut state).await.unwrap();
        assert_eq!(outcome, Outcome::Traded);
        // We gave away a special mon, so we expect its refreshed moves;
        // the peer asked for ours too.
        assert!(state.expect_mvs_in);
        assert!(state.owe_mvs_out);
        assert!(state.subsequent);
    }

    #[tokio::test]
    async fn test_menu_decline_repeats_cycle() {
        let mut replies = Vec::new();
        replies.extend(vec![0x70; 10]);
        replies.extend([0x00, 0x00, 0xFE]);
        replies.extend(vec![0x71; 10]); // we decline
        replies.extend([0x00, 0x00, 0xFE]);
        // Second cycle: we cancel out of the menu.
        replies.extend(vec![0x7F; 10]);
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let tables = StaticTables::empty(Generation::Two);
        let mut m = mediator(&mut link, &relay, &tables);

        let mut state = SessionState::new(Generation::Two);
        state.have_peer = true;
        state.own_party = party_bytes(&[(0x01, 0x19)]);
        state.peer_party = party_bytes(&[(0x03, 0x2A)]);

        let peer = mon(0x03, 0x2A);
        let mut chc = vec![0x70];
        chc.extend_from_slice(&peer.to_bytes());
        inject_counter_tagged(&relay, b"CHC2", 5, &chc);
        inject_counter_tagged(&relay, b"ACP2", 6, &[0x71]); // peer declines too

        let outcome = menu_loop(&mut m, &mut state).await.unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(m.records.len(), 1);
        assert_eq!(m.records[0].outcome, TradeOutcome::Declined);
    }

    #[tokio::test]
    async fn test_ghost_menu_cancels_and_adopts_peer_payload() {
        let mut replies = Vec::new();
        replies.extend(vec![0x70; 10]); // player picks anything
        replies.extend([0x00, 0x00, 0xFE]); // forwarded cancel drains
        let mut link = ScriptedLink::new(replies);
        let (relay, _rx) = RelayClient::test_pair(Duration::from_millis(1));
        let tables = StaticTables::empty(Generation::Two);
        let mut m = mediator(&mut link, &relay, &tables);

        let mut state = SessionState::new(Generation::Two);
        state.ghost = true;

        // Real peer payload arrives as one FLL blob.
        let mut blob = vec![0u8; 10];
        blob.extend_from_slice(&party_bytes(&[(0x07, 0x2C)]));
        blob.extend_from_slice(&vec![0u8; 197]);
        blob.extend_from_slice(&vec![0u8; 385]);
        relay.inject(
            &Frame::Set {
                tag: *b"FLL2",
                payload: blob,
            }
            .encode(),
        );

        let outcome = menu_loop(&mut m, &mut state).await.unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!state.ghost);
        assert!(state.have_peer);
        assert_eq!(state.peer_party_section().species_at(0), 0x2C);
    }

    #[tokio::test]
    async fn test_buffered_starting_sequence_collects_own_sections() {
        // Gen 2 buffered feed: every section costs 2 preamble reads plus
        // one reply per byte.
        let lengths = Generation::Two.section_lengths();
        let mut replies = Vec::new();
        for (idx, &len) in lengths.iter().enumerate() {
            let starter = if idx == SEC_MAIL { 0x20 } else { 0xFD };
            replies.push(starter);
            for i in 0..len {
                replies.push((i % 200) as u8 + 1);
            }
            replies.push(0x00);
        }
        let mut link = ScriptedLink::new(replies);
        let (relay, mut rx) = RelayClient::test_pair(Duration::from_millis(1));
        let mut tables = StaticTables::empty(Generation::Two);
        // Bundled default party blob: all sections concatenated.
        let mut blob = vec![0u8; 10];
        blob.extend_from_slice(&party_bytes(&[(0x01, 0x19)]));
        blob.extend_from_slice(&vec![0u8; 197]);
        blob.extend_from_slice(&vec![0u8; 385]);
        tables.default_party = Some(blob);
        let mut m = mediator(&mut link, &relay, &tables);

        let mut state = SessionState::new(Generation::Two);
        starting_sequence(&mut m, &mut state).await.unwrap();

        assert!(state.ghost);
        for (idx, &len) in lengths.iter().enumerate() {
            assert_eq!(state.own_wire[idx].len(), len, "section {idx}");
        }
        // The FLL publish must have gone out.
        let mut saw_fll = false;
        while let Ok(raw) = rx.try_recv() {
            if let Some(Frame::Set { tag, payload }) = Frame::decode(&raw) {
                if &tag == b"FLL2" {
                    assert_eq!(payload.len(), lengths.iter().sum::<usize>());
                    saw_fll = true;
                }
            }
        }
        assert!(saw_fll);
    }
}

