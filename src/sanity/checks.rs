use crate::data::text::{NEWLINE_GEN12, QUESTION_GEN12, TERMINATOR_GEN12};
use crate::data::StaticTables;
use crate::types::Generation;

/// Default replacement move (Tackle).
const DEFAULT_MOVE: u8 = 0x21;
/// Gen 2 egg sentinel in the species list.
const EGG_SPECIES: u8 = 0xFD;
/// Species-list terminator.
const LIST_END: u8 = 0xFF;
/// Valid Gen 1 type ids (Normal..Dragon, with the 9..19 gap).
const GEN1_TYPES: [u8; 15] = [0, 1, 2, 3, 4, 5, 7, 8, 20, 21, 22, 23, 24, 25, 26];
/// Gen 2 mail-holding item ids.
pub const MAIL_ITEMS: [u8; 10] = [0x9E, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, 0xC0];

/// One entry of the position-indexed check table. `checks_map.bin` stores
/// one of these indices per byte position; patching validation behavior is
/// a data change, not a code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Nothing,
    Text,
    TextNewline,
    TextFinal,
    TextFinalNoEnd,
    TeamSize,
    Species,
    SpeciesSpecial,
    SpeciesForceTerminate,
    Move,
    Item,
    Level,
    CheckHp,
    LoadStatExp,
    LoadStatIv,
    CheckStat,
    Pp,
    Experience,
    EggCyclesFriendship,
    Type,
    MailSpecies,
    MailItem,
    MailSameSpecies,
    PokemonPatchSet,
    MailPatchSet,
    JapaneseMailPatchSet,
}

impl Check {
    pub fn from_index(idx: u8) -> Option<Self> {
        use Check::*;
        Some(match idx {
            0 => Nothing,
            1 => Text,
            2 => TextNewline,
            3 => TextFinal,
            4 => TextFinalNoEnd,
            5 => TeamSize,
            6 => Species,
            7 => SpeciesSpecial,
            8 => SpeciesForceTerminate,
            9 => Move,
            10 => Item,
            11 => Level,
            12 => CheckHp,
            13 => LoadStatExp,
            14 => LoadStatIv,
            15 => CheckStat,
            16 => Pp,
            17 => Experience,
            18 => EggCyclesFriendship,
            19 => Type,
            20 => MailSpecies,
            21 => MailItem,
            22 => MailSameSpecies,
            23 => PokemonPatchSet,
            24 => MailPatchSet,
            25 => JapaneseMailPatchSet,
            _ => return None,
        })
    }
}

/// Accumulator threaded through one walk over a section. The check
/// functions read and update it; it never outlives the walk.
pub struct CheckContext<'a> {
    tables: &'a StaticTables,
    generation: Generation,
    species: u8,
    team_size: u8,
    species_list_pos: u8,
    moves: [u8; 4],
    move_cursor: usize,
    pp_cursor: usize,
    exp: u32,
    exp_bytes: u8,
    stat_pending: Option<u8>,
    patch_set_index: usize,
    substitutions: u32,
}

impl<'a> CheckContext<'a> {
    pub fn new(tables: &'a StaticTables, generation: Generation) -> Self {
        Self {
            tables,
            generation,
            species: generation.default_species(),
            team_size: 1,
            species_list_pos: 0,
            moves: [0; 4],
            move_cursor: 0,
            pp_cursor: 0,
            exp: 0,
            exp_bytes: 0,
            stat_pending: None,
            patch_set_index: 0,
            substitutions: 0,
        }
    }

    pub fn substitutions(&self) -> u32 {
        self.substitutions
    }

    fn clean(&mut self, value: u8, ok: bool, default: u8) -> u8 {
        if ok {
            value
        } else {
            self.substitutions += 1;
            default
        }
    }

    fn species_ok(&self, b: u8) -> bool {
        match &self.tables.bad_species {
            Some(bad) => !bad.contains(b) && b != 0x00,
            None => true,
        }
    }

    fn move_ok(&self, b: u8) -> bool {
        match &self.tables.bad_moves {
            Some(bad) => !bad.contains(b),
            None => true,
        }
    }

    fn item_ok(&self, b: u8) -> bool {
        match &self.tables.bad_items {
            Some(bad) => !bad.contains(b),
            None => true,
        }
    }

    fn text_ok(&self, b: u8) -> bool {
        match &self.tables.bad_text {
            Some(bad) => !bad.contains(b),
            None => true,
        }
    }

    /// Apply one check to the byte at the current position. Never rejects;
    /// substitutes a per-field default instead.
    pub fn apply(&mut self, check: Check, b: u8) -> u8 {
        match check {
            Check::Nothing => b,
            Check::Text => {
                let ok = b == TERMINATOR_GEN12 || self.text_ok(b);
                self.clean(b, ok, QUESTION_GEN12)
            }
            Check::TextNewline => {
                let ok = b == TERMINATOR_GEN12 || b == NEWLINE_GEN12 || self.text_ok(b);
                self.clean(b, ok, QUESTION_GEN12)
            }
            Check::TextFinal => self.clean(b, b == TERMINATOR_GEN12, TERMINATOR_GEN12),
            Check::TextFinalNoEnd => {
                let ok = b == TERMINATOR_GEN12 || self.text_ok(b);
                self.clean(b, ok, QUESTION_GEN12)
            }
            Check::TeamSize => {
                let clamped = b.clamp(1, 6);
                self.team_size = clamped;
                self.clean(b, b == clamped, clamped)
            }
            Check::Species => {
                let cleaned = self.clean(b, self.species_ok(b), self.generation.default_species());
                self.species = cleaned;
                cleaned
            }
            Check::SpeciesSpecial => {
                let pos = self.species_list_pos;
                self.species_list_pos += 1;
                if pos >= self.team_size {
                    return self.clean(b, b == LIST_END, LIST_END);
                }
                let ok = b == EGG_SPECIES || self.species_ok(b);
                self.clean(b, ok, self.generation.default_species())
            }
            Check::SpeciesForceTerminate => self.clean(b, b == LIST_END, LIST_END),
            Check::Move => {
                let cleaned = if b == 0 {
                    0
                } else {
                    self.clean(b, self.move_ok(b), DEFAULT_MOVE)
                };
                self.moves[self.move_cursor % 4] = cleaned;
                self.move_cursor += 1;
                cleaned
            }
            Check::Item => {
                let ok = b == 0 || self.item_ok(b);
                self.clean(b, ok, 0)
            }
            Check::Level => {
                if self.exp_bytes >= 3 {
                    let level = self.tables.level_for_exp(self.species, self.exp);
                    self.clean(b, b == level, level)
                } else {
                    let clamped = b.clamp(2, 100);
                    self.clean(b, b == clamped, clamped)
                }
            }
            Check::CheckHp | Check::CheckStat => self.check_u16_be(check, b),
            Check::LoadStatExp | Check::LoadStatIv => b,
            Check::Pp => {
                let ups = b >> 6;
                let pp = b & 0x3F;
                let base = self.tables.base_pp(self.moves[self.pp_cursor % 4]);
                self.pp_cursor += 1;
                let mut cap = base + (base / 5) * ups;
                // 40-PP moves top out at 61, not 64.
                if base == 40 && ups == 3 {
                    cap = 61;
                }
                let cleaned = pp.min(cap) | (ups << 6);
                self.clean(b, b == cleaned, cleaned)
            }
            Check::Experience => {
                self.exp = (self.exp << 8) | u32::from(b);
                self.exp_bytes += 1;
                if self.exp_bytes == 3 && self.exp > self.tables.max_exp(self.species) {
                    let max = self.tables.max_exp(self.species);
                    self.exp = max;
                    return self.clean(b, false, (max & 0xFF) as u8);
                }
                b
            }
            Check::EggCyclesFriendship => b,
            Check::Type => {
                let ok = GEN1_TYPES.contains(&b);
                self.clean(b, ok, 0)
            }
            Check::MailSpecies => {
                let ok = b == 0 || self.species_ok(b);
                self.clean(b, ok, 0)
            }
            Check::MailItem => {
                let ok = b == 0 || MAIL_ITEMS.contains(&b);
                self.clean(b, ok, 0)
            }
            Check::MailSameSpecies => self.clean(b, b == self.species, self.species),
            Check::PokemonPatchSet => {
                if b == 0xFF {
                    self.patch_set_index += 1;
                    return b;
                }
                let set = &self.tables.pokemon_patch_sets[self.patch_set_index.min(1)];
                let ok = set.contains(b);
                self.clean(b, ok, 0x00)
            }
            Check::MailPatchSet => {
                if b == 0xFF {
                    return b;
                }
                self.clean(b, self.tables.mail_patch_set.contains(b), 0x00)
            }
            Check::JapaneseMailPatchSet => {
                if b == 0xFF {
                    return b;
                }
                match &self.tables.jp_mail_patch_set {
                    Some(set) => self.clean(b, set.contains(b), 0x00),
                    None => b,
                }
            }
        }
    }

    /// Big-endian u16 spread over two consecutive positions, clamped to
    /// [min, 999]. The high byte is capped first; the low byte finishes
    /// the clamp once both halves are known.
    fn check_u16_be(&mut self, check: Check, b: u8) -> u8 {
        const MAX: u16 = 999;
        match self.stat_pending.take() {
            None => {
                let hi = b.min((MAX >> 8) as u8);
                self.stat_pending = Some(hi);
                self.clean(b, b == hi, hi)
            }
            Some(hi) => {
                let value = u16::from_be_bytes([hi, b]);
                let min = if check == Check::CheckStat { 1 } else { 0 };
                let clamped = value.clamp(min, MAX);
                let lo = (clamped & 0xFF) as u8;
                self.clean(b, b == lo, lo)
            }
        }
    }
}
