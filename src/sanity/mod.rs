pub mod checks;

pub use checks::{Check, CheckContext, MAIL_ITEMS};

use crate::data::StaticTables;
use crate::types::Generation;

/// Position-indexed sanitizer over section buffers. Walks a buffer with
/// the check map for its shape, substituting defaults in place. Never
/// rejects. With sanity checks disabled (or the tables missing) every
/// walk is the identity.
pub struct Sanitizer<'a> {
    tables: &'a StaticTables,
    generation: Generation,
    enabled: bool,
}

impl<'a> Sanitizer<'a> {
    pub fn new(tables: &'a StaticTables, generation: Generation, enabled: bool) -> Self {
        let enabled = enabled && tables.sanity_tables_present();
        Self {
            tables,
            generation,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Sanitize a full party section in place.
    pub fn clean_section(&self, section_index: usize, buf: &mut [u8]) {
        if !self.enabled {
            return;
        }
        let Some(maps) = &self.tables.checks_maps else {
            return;
        };
        let Some(map) = maps.get(section_index) else {
            return;
        };
        self.walk(map, buf, &format!("section {section_index}"));
    }

    /// Sanitize a peer-sent single-Pokémon record (trade choice) in place.
    pub fn clean_single_pokemon(&self, buf: &mut [u8]) {
        if !self.enabled {
            return;
        }
        if let Some(map) = &self.tables.single_checks_map {
            self.walk(map, buf, "single pokemon");
        }
    }

    /// Sanitize a moves/PP refresh payload in place.
    pub fn clean_moves(&self, buf: &mut [u8]) {
        if !self.enabled {
            return;
        }
        if let Some(map) = &self.tables.moves_checks_map {
            self.walk(map, buf, "moves");
        }
    }

    fn walk(&self, map: &[u8], buf: &mut [u8], what: &str) {
        let mut ctx = CheckContext::new(self.tables, self.generation);
        for (pos, byte) in buf.iter_mut().enumerate() {
            let Some(&idx) = map.get(pos) else { break };
            let Some(check) = Check::from_index(idx) else {
                continue;
            };
            let cleaned = ctx.apply(check, *byte);
            if cleaned != *byte {
                tracing::debug!(
                    "sanity: {what} pos {pos} 0x{:02X} -> 0x{cleaned:02X}",
                    *byte
                );
                *byte = cleaned;
            }
        }
        if ctx.substitutions() > 0 {
            tracing::debug!("sanity: {what}: {} substitutions", ctx.substitutions());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tables::IdBitmap;

    fn test_tables() -> StaticTables {
        let mut t = StaticTables::empty(Generation::Two);
        t.bad_species = Some(IdBitmap::from_byte_list(&[0x00, 0xFE, 0xFF]));
        t.bad_moves = Some(IdBitmap::from_byte_list(&[0xFF]));
        t.bad_items = Some(IdBitmap::from_byte_list(&[]));
        t.bad_text = Some(IdBitmap::from_byte_list(&[0x00]));
        t.moves_pp = vec![35; 256];
        t.exp_groups = vec![0; 256];
        t.exp_curves = vec![(1..=100u32).map(|l| l * l * l).collect()];
        // A tiny synthetic section: count, two species slots, terminator,
        // a move and an item.
        t.checks_maps = Some(vec![vec![], vec![5, 7, 7, 8, 9, 10]]);
        t.single_checks_map = Some(vec![6, 9, 9, 9, 9]);
        t.moves_checks_map = Some(vec![9, 9, 9, 9, 16, 16, 16, 16]);
        t
    }

    #[test]
    fn test_clean_section_substitutes() {
        let t = test_tables();
        let s = Sanitizer::new(&t, Generation::Two, true);
        let mut buf = [9, 0x19, 0xFE, 0x42, 0xFF, 0x07];
        s.clean_section(1, &mut buf);
        assert_eq!(buf, [6, 0x19, 0x13, 0xFF, 0x21, 0x07]);
    }

    #[test]
    fn test_disabled_sanitizer_is_identity() {
        let t = test_tables();
        let s = Sanitizer::new(&t, Generation::Two, false);
        let mut buf = [9, 0x19, 0xFE, 0x42, 0xFF, 0x07];
        let before = buf;
        s.clean_section(1, &mut buf);
        assert_eq!(buf, before);
    }

    #[test]
    fn test_missing_tables_disable_sanitizer() {
        let t = StaticTables::empty(Generation::Two);
        let s = Sanitizer::new(&t, Generation::Two, true);
        assert!(!s.enabled());
    }

    #[test]
    fn test_clean_section_idempotent() {
        let t = test_tables();
        let s = Sanitizer::new(&t, Generation::Two, true);
        let mut buf = [0u8, 0xFE, 0xFE, 0x00, 0xFF, 0xFF];
        s.clean_section(1, &mut buf);
        let once = buf;
        s.clean_section(1, &mut buf);
        assert_eq!(buf, once);
    }

    #[test]
    fn test_clean_single_pokemon_uses_its_map() {
        let t = test_tables();
        let s = Sanitizer::new(&t, Generation::Two, true);
        let mut buf = [0xFE, 0x05, 0x06, 0xFF, 0x00];
        s.clean_single_pokemon(&mut buf);
        assert_eq!(buf, [0x13, 0x05, 0x06, 0x21, 0x00]);
    }

    #[test]
    fn test_clean_moves_clamps_pp() {
        let t = test_tables();
        let s = Sanitizer::new(&t, Generation::Two, true);
        let mut buf = [0x21, 0x22, 0x00, 0x00, 0x3F, 0x3F, 0x05, 0x05];
        s.clean_moves(&mut buf);
        // Base PP 35 and no ups: remaining PP capped at 35.
        assert_eq!(buf[4], 35);
        assert_eq!(buf[5], 35);
        assert_eq!(buf[6], 0x05);
    }
}
