use crate::data::text::TERMINATOR_GEN12;
use crate::sanity::MAIL_ITEMS;
use crate::types::Generation;

/// Section indices within a Gen 1/2 transfer.
pub const SEC_RANDOM: usize = 0;
pub const SEC_PARTY: usize = 1;
pub const SEC_PATCH: usize = 2;
pub const SEC_MAIL: usize = 3;

/// Species-list sentinel for a Gen 2 egg.
pub const EGG_SPECIES: u8 = 0xFD;
/// Hatching cycles written when a pool Pokémon arrives as an egg.
pub const EGG_CYCLES: u8 = 10;

pub const MAIL_MSG_LEN: usize = 33;
pub const MAIL_META_LEN: usize = 14;
/// Translated/patched region of the mail section: 6 messages + 6 senders.
pub const MAIL_TEXT_REGION: usize = 6 * (MAIL_MSG_LEN + MAIL_META_LEN);

const MAX_PARTY: usize = 6;
const JP_TEXT_LEN: usize = 6;

/// Fixed offsets of the party data section (section 1).
#[derive(Debug, Clone, Copy)]
pub struct PartyLayout {
    pub section_len: usize,
    pub name: usize,
    pub count: usize,
    pub species_list: usize,
    pub trainer_id: usize,
    pub records: usize,
    pub record_len: usize,
    pub ot_names: usize,
    pub nicknames: usize,
    pub text_len: usize,
    // Offsets within one record.
    pub moves_off: usize,
    pub pp_off: usize,
    pub item_off: Option<usize>,
    pub curr_hp_off: usize,
    pub cycles_off: Option<usize>,
}

pub fn layout(gen: Generation) -> PartyLayout {
    match gen {
        Generation::One => PartyLayout {
            section_len: 418,
            name: 0,
            count: 11,
            species_list: 12,
            trainer_id: 19,
            records: 21,
            record_len: 44,
            ot_names: 21 + 6 * 44,
            nicknames: 21 + 6 * 44 + 6 * 11,
            text_len: 11,
            moves_off: 8,
            pp_off: 29,
            item_off: None,
            curr_hp_off: 1,
            cycles_off: None,
        },
        Generation::Two => PartyLayout {
            section_len: 444,
            name: 0,
            count: 11,
            species_list: 12,
            trainer_id: 19,
            records: 21,
            record_len: 48,
            ot_names: 21 + 6 * 48,
            nicknames: 21 + 6 * 48 + 6 * 11,
            text_len: 11,
            moves_off: 2,
            pp_off: 23,
            item_off: Some(1),
            curr_hp_off: 34,
            cycles_off: Some(27),
        },
        Generation::Three => unreachable!("gen 3 has no byte-section party layout"),
    }
}

/// One Pokémon in single-record wire form: core record, OT name,
/// nickname, and (Gen 2) attached mail message + sender block. This is
/// the payload of `CHC`/`POL` frames; the species byte is `core[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinglePokemon {
    pub core: Vec<u8>,
    pub ot: Vec<u8>,
    pub nick: Vec<u8>,
    pub mail: Vec<u8>,
}

impl SinglePokemon {
    pub fn wire_len(gen: Generation) -> usize {
        let l = layout(gen);
        let mail = if gen == Generation::Two {
            MAIL_MSG_LEN + MAIL_META_LEN
        } else {
            0
        };
        l.record_len + 2 * l.text_len + mail
    }

    pub fn from_bytes(gen: Generation, raw: &[u8]) -> Option<Self> {
        if raw.len() != Self::wire_len(gen) {
            return None;
        }
        let l = layout(gen);
        let (core, rest) = raw.split_at(l.record_len);
        let (ot, rest) = rest.split_at(l.text_len);
        let (nick, mail) = rest.split_at(l.text_len);
        Some(Self {
            core: core.to_vec(),
            ot: ot.to_vec(),
            nick: nick.to_vec(),
            mail: mail.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.core.len() + self.ot.len() + self.nick.len() + self.mail.len());
        out.extend_from_slice(&self.core);
        out.extend_from_slice(&self.ot);
        out.extend_from_slice(&self.nick);
        out.extend_from_slice(&self.mail);
        out
    }

    pub fn species(&self) -> u8 {
        self.core.first().copied().unwrap_or(0)
    }
}

/// The party data section, with slot-indexed views borrowing into the
/// buffer and a single post-trade mutator.
pub struct PartySection {
    gen: Generation,
    layout: PartyLayout,
    buf: Vec<u8>,
}

impl PartySection {
    pub fn new(gen: Generation, buf: Vec<u8>) -> Self {
        let layout = layout(gen);
        debug_assert_eq!(buf.len(), layout.section_len);
        Self { gen, layout, buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn count(&self) -> usize {
        (self.buf[self.layout.count] as usize).clamp(1, MAX_PARTY)
    }

    pub fn set_count(&mut self, count: usize) {
        self.buf[self.layout.count] = count.clamp(1, MAX_PARTY) as u8;
        for slot in count..MAX_PARTY {
            self.buf[self.layout.species_list + slot] = 0xFF;
        }
        self.buf[self.layout.species_list + MAX_PARTY] = 0xFF;
    }

    pub fn species_at(&self, slot: usize) -> u8 {
        self.buf[self.layout.species_list + slot]
    }

    pub fn set_species_at(&mut self, slot: usize, species: u8) {
        self.buf[self.layout.species_list + slot] = species;
    }

    pub fn core_at(&self, slot: usize) -> &[u8] {
        let start = self.layout.records + slot * self.layout.record_len;
        &self.buf[start..start + self.layout.record_len]
    }

    pub fn core_at_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = self.layout.records + slot * self.layout.record_len;
        &mut self.buf[start..start + self.layout.record_len]
    }

    pub fn ot_at(&self, slot: usize) -> &[u8] {
        let start = self.layout.ot_names + slot * self.layout.text_len;
        &self.buf[start..start + self.layout.text_len]
    }

    pub fn nickname_at(&self, slot: usize) -> &[u8] {
        let start = self.layout.nicknames + slot * self.layout.text_len;
        &self.buf[start..start + self.layout.text_len]
    }

    pub fn held_item_at(&self, slot: usize) -> Option<u8> {
        let off = self.layout.item_off?;
        Some(self.core_at(slot)[off])
    }

    /// Any slot holding a mail item means the mail section carries data.
    pub fn has_mail(&self) -> bool {
        (0..self.count()).any(|slot| {
            self.held_item_at(slot)
                .is_some_and(|item| MAIL_ITEMS.contains(&item))
        })
    }

    /// Copy one slot out into single-record wire form.
    pub fn extract_single(&self, slot: usize, mail_section: Option<&[u8]>) -> SinglePokemon {
        let mut core = self.core_at(slot).to_vec();
        core[0] = self.species_at(slot);
        let mail = match mail_section {
            Some(mail) if self.gen == Generation::Two => {
                let msg = &mail[slot * MAIL_MSG_LEN..(slot + 1) * MAIL_MSG_LEN];
                let meta_base = 6 * MAIL_MSG_LEN + slot * MAIL_META_LEN;
                let meta = &mail[meta_base..meta_base + MAIL_META_LEN];
                let mut m = Vec::with_capacity(MAIL_MSG_LEN + MAIL_META_LEN);
                m.extend_from_slice(msg);
                m.extend_from_slice(meta);
                m
            }
            _ if self.gen == Generation::Two => vec![0; MAIL_MSG_LEN + MAIL_META_LEN],
            _ => Vec::new(),
        };
        SinglePokemon {
            core,
            ot: self.ot_at(slot).to_vec(),
            nick: self.nickname_at(slot).to_vec(),
            mail,
        }
    }

    /// Write a single record into `slot`, species list included.
    pub fn insert_single(&mut self, slot: usize, mon: &SinglePokemon) {
        self.set_species_at(slot, mon.species());
        self.core_at_mut(slot).copy_from_slice(&mon.core);
        let l = self.layout;
        let ot = l.ot_names + slot * l.text_len;
        self.buf[ot..ot + l.text_len].copy_from_slice(&mon.ot);
        let nick = l.nicknames + slot * l.text_len;
        self.buf[nick..nick + l.text_len].copy_from_slice(&mon.nick);
    }

    /// Post-trade party mutation: remove `slot`, shifting later slots
    /// down, and write `incoming` into the last occupied slot. Count and
    /// all other relative order are preserved.
    pub fn swap_with_last(&mut self, slot: usize, incoming: &SinglePokemon) {
        let last = self.count() - 1;
        for i in slot..last {
            let next = self.extract_single(i + 1, None);
            self.insert_single(i, &next);
        }
        self.insert_single(last, incoming);
    }

    /// Rewrite the last slot's move/PP block from an `MVS` refresh.
    pub fn set_last_moves(&mut self, moves: &[u8; 4], pps: &[u8; 4]) {
        let last = self.count() - 1;
        let (m_off, p_off) = (self.layout.moves_off, self.layout.pp_off);
        let core = self.core_at_mut(last);
        core[m_off..m_off + 4].copy_from_slice(moves);
        core[p_off..p_off + 4].copy_from_slice(pps);
    }

    /// Convert the last slot into an egg (Gen 2 pool trades): egg sentinel
    /// in the species list, hatching cycles set, HP zeroed, `EGG` nickname.
    pub fn make_last_egg(&mut self, egg_nick: &[u8]) {
        let last = self.count() - 1;
        self.set_species_at(last, EGG_SPECIES);
        let l = self.layout;
        if let Some(cycles) = l.cycles_off {
            self.core_at_mut(last)[cycles] = EGG_CYCLES;
        }
        let hp = l.curr_hp_off;
        let core = self.core_at_mut(last);
        core[hp] = 0;
        core[hp + 1] = 0;
        let nick = l.nicknames + last * l.text_len;
        let field = &mut self.buf[nick..nick + l.text_len];
        field.fill(TERMINATOR_GEN12);
        let n = egg_nick.len().min(l.text_len);
        field[..n].copy_from_slice(&egg_nick[..n]);
    }
}

/// Expand a Japanese party section to the International layout by
/// padding every 6-byte text field to 11 bytes with 0x50.
pub fn japanese_to_international(jp: &[u8], gen: Generation) -> Vec<u8> {
    let l = layout(gen);
    let pad = l.text_len - JP_TEXT_LEN;
    let mut out = Vec::with_capacity(l.section_len);
    let mut cursor = 0;
    let mut take_text = |out: &mut Vec<u8>, cursor: &mut usize| {
        out.extend_from_slice(&jp[*cursor..*cursor + JP_TEXT_LEN]);
        out.extend(std::iter::repeat(TERMINATOR_GEN12).take(pad));
        *cursor += JP_TEXT_LEN;
    };
    take_text(&mut out, &mut cursor); // trainer name
    let mid = l.ot_names - l.count; // count..records block is text-free
    out.extend_from_slice(&jp[cursor..cursor + mid]);
    cursor += mid;
    for _ in 0..2 * MAX_PARTY {
        take_text(&mut out, &mut cursor);
    }
    out.extend_from_slice(&jp[cursor..]); // trailing bytes
    out.resize(l.section_len, 0);
    out
}

/// Shrink an International party section to the Japanese layout by
/// dropping the padding bytes again.
pub fn international_to_japanese(intl: &[u8], gen: Generation) -> Vec<u8> {
    let l = layout(gen);
    let mut out = Vec::new();
    let mut cursor = 0;
    let mut take_text = |out: &mut Vec<u8>, cursor: &mut usize| {
        out.extend_from_slice(&intl[*cursor..*cursor + JP_TEXT_LEN]);
        *cursor += l.text_len;
    };
    take_text(&mut out, &mut cursor);
    let mid = l.ot_names - l.count;
    out.extend_from_slice(&intl[cursor..cursor + mid]);
    cursor += mid;
    for _ in 0..2 * MAX_PARTY {
        take_text(&mut out, &mut cursor);
    }
    out.extend_from_slice(&intl[cursor..]);
    out
}

/// Japanese section length on the wire.
pub fn japanese_section_len(gen: Generation) -> usize {
    let l = layout(gen);
    l.section_len - 13 * (l.text_len - JP_TEXT_LEN)
}

/// Offset of the record block within a Japanese-layout party section
/// (only the trainer name sits in front of it).
pub fn japanese_records_offset(gen: Generation) -> usize {
    let l = layout(gen);
    l.records - (l.text_len - JP_TEXT_LEN)
}

/// Byte-translate the text region of a mail section in place.
pub fn translate_mail(mail: &mut [u8], table: &[u8; 256]) {
    for b in mail.iter_mut().take(MAIL_TEXT_REGION) {
        *b = table[*b as usize];
    }
}
