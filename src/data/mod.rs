pub mod tables;
pub mod text;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::AppError;
use crate::types::Generation;
use tables::{EvolutionRule, IdBitmap};

/// Every bundled table, loaded once at startup and immutable thereafter.
/// Gen 1/2 and Gen 3 populate different subsets; fields a generation does
/// not ship stay empty.
pub struct StaticTables {
    pub generation: Generation,
    pub base_stats: Vec<[u8; 6]>,
    pub exp_groups: Vec<u8>,
    pub exp_curves: Vec<Vec<u32>>,
    pub names: Vec<String>,
    pub moves_pp: Vec<u8>,
    pub egg_nick: Vec<u8>,
    pub text_table: HashMap<u8, char>,

    // Gen 1/2.
    pub evolutions: Vec<EvolutionRule>,
    pub special_mons: IdBitmap,
    pub bad_species: Option<IdBitmap>,
    pub bad_moves: Option<IdBitmap>,
    pub bad_items: Option<IdBitmap>,
    pub bad_text: Option<IdBitmap>,
    pub checks_maps: Option<Vec<Vec<u8>>>,
    pub single_checks_map: Option<Vec<u8>>,
    pub moves_checks_map: Option<Vec<u8>>,
    pub pokemon_patch_sets: [IdBitmap; 2],
    pub mail_patch_set: IdBitmap,
    pub no_mail_section: Vec<u8>,
    pub base_random_section: Vec<u8>,
    pub default_party: Option<Vec<u8>>,

    // Gen 1/2 Japanese support; all-or-nothing.
    pub jp_mail_patch_set: Option<IdBitmap>,
    pub mail_en_to_jp: Option<[u8; 256]>,
    pub mail_jp_to_en: Option<[u8; 256]>,
    pub mail_checks_jp: Option<Vec<u8>>,

    // Gen 3.
    pub invalid_species_g3: HashSet<u16>,
    pub invalid_items_g3: HashSet<u16>,
    pub abilities: Vec<[u8; 2]>,
    pub default_pool_party: Option<Vec<u8>>,
}

impl StaticTables {
    pub fn load(root: &Path, generation: Generation) -> Result<Self, AppError> {
        let dir = root.join(generation.data_dir());
        let mut t = Self::empty(generation);

        t.base_stats = tables::parse_base_stats(&tables::read_required(&dir.join("stats.bin"))?)?;
        t.exp_groups = tables::read_required(&dir.join("pokemon_exp_groups.bin"))?;
        t.exp_curves =
            tables::parse_exp_curves(&tables::read_required_text(&dir.join("pokemon_exp.txt"))?)?;
        t.names = tables::parse_names(&tables::read_required_text(&dir.join("pokemon_names.txt"))?);
        t.moves_pp = tables::read_required(&dir.join("moves_pp_list.bin"))?;
        t.egg_nick = tables::read_required(&dir.join("egg_nick.bin"))?;
        t.text_table =
            tables::parse_text_table(&tables::read_required_text(&dir.join("text_conv.txt"))?)?;

        match generation {
            Generation::One | Generation::Two => t.load_gen12(&dir)?,
            Generation::Three => t.load_gen3(&dir)?,
        }
        tracing::info!(
            "loaded static tables for {:?} from {}",
            generation,
            dir.display()
        );
        Ok(t)
    }

    pub(crate) fn empty(generation: Generation) -> Self {
        Self {
            generation,
            base_stats: Vec::new(),
            exp_groups: Vec::new(),
            exp_curves: Vec::new(),
            names: Vec::new(),
            moves_pp: Vec::new(),
            egg_nick: Vec::new(),
            text_table: HashMap::new(),
            evolutions: Vec::new(),
            special_mons: IdBitmap::empty(),
            bad_species: None,
            bad_moves: None,
            bad_items: None,
            bad_text: None,
            checks_maps: None,
            single_checks_map: None,
            moves_checks_map: None,
            pokemon_patch_sets: [IdBitmap::empty(), IdBitmap::empty()],
            mail_patch_set: IdBitmap::empty(),
            no_mail_section: Vec::new(),
            base_random_section: Vec::new(),
            default_party: None,
            jp_mail_patch_set: None,
            mail_en_to_jp: None,
            mail_jp_to_en: None,
            mail_checks_jp: None,
            invalid_species_g3: HashSet::new(),
            invalid_items_g3: HashSet::new(),
            abilities: Vec::new(),
            default_pool_party: None,
        }
    }

    fn load_gen12(&mut self, dir: &Path) -> Result<(), AppError> {
        self.evolutions =
            tables::parse_evolutions(&tables::read_required(&dir.join("evolution_ids.bin"))?)?;
        self.special_mons =
            IdBitmap::from_byte_list(&tables::read_required(&dir.join("learnset_evos.bin"))?);
        self.pokemon_patch_sets = [
            IdBitmap::from_byte_list(&tables::read_required(
                &dir.join("pokemon_patch_set_0.bin"),
            )?),
            IdBitmap::from_byte_list(&tables::read_required(
                &dir.join("pokemon_patch_set_1.bin"),
            )?),
        ];
        self.mail_patch_set =
            IdBitmap::from_byte_list(&tables::read_required(&dir.join("mail_patch_set.bin"))?);
        self.no_mail_section = tables::read_required(&dir.join("no_mail_section.bin"))?;
        self.base_random_section = tables::read_required(&dir.join("base_random_section.bin"))?;
        self.default_party = tables::read_optional(&dir.join("base.bin"));

        // Sanity tables are optional as a block: without them the
        // validator runs as identity.
        let bad = |name: &str| {
            tables::read_optional(&dir.join(name)).map(|raw| IdBitmap::from_byte_list(&raw))
        };
        self.bad_species = bad("bad_ids_pokemon.bin");
        self.bad_moves = bad("bad_ids_moves.bin");
        self.bad_items = bad("bad_ids_items.bin");
        self.bad_text = bad("bad_ids_text.bin");
        self.checks_maps = tables::read_optional(&dir.join("checks_map.bin"))
            .map(|raw| split_checks_map(&raw, self.generation))
            .transpose()?;
        self.single_checks_map = tables::read_optional(&dir.join("single_pokemon_checks_map.bin"));
        self.moves_checks_map = tables::read_optional(&dir.join("moves_checks_map.bin"));

        // Japanese support is optional as a block too.
        self.jp_mail_patch_set = tables::read_optional(&dir.join("japanese_mail_patch_set.bin"))
            .map(|raw| IdBitmap::from_byte_list(&raw));
        self.mail_en_to_jp = tables::read_optional(&dir.join("mail_conversion_table_en_to_jp.bin"))
            .map(|raw| tables::parse_byte_substitution(&raw))
            .transpose()?;
        self.mail_jp_to_en = tables::read_optional(&dir.join("mail_conversion_table_jp_to_en.bin"))
            .map(|raw| tables::parse_byte_substitution(&raw))
            .transpose()?;
        self.mail_checks_jp = tables::read_optional(&dir.join("mail_checks_jp.bin"));
        Ok(())
    }

    fn load_gen3(&mut self, dir: &Path) -> Result<(), AppError> {
        self.invalid_species_g3 =
            tables::parse_u16_set(&tables::read_required(&dir.join("invalid_pokemon.bin"))?)?;
        self.invalid_items_g3 =
            tables::parse_u16_set(&tables::read_required(&dir.join("invalid_held_items.bin"))?)?;
        self.abilities =
            tables::parse_abilities(&tables::read_required(&dir.join("abilities.bin"))?)?;
        self.default_party = tables::read_optional(&dir.join("base.bin"));
        self.default_pool_party = tables::read_optional(&dir.join("base_pool.bin"));
        Ok(())
    }

    /// True when the full set of Gen 1/2 sanity tables is present.
    pub fn sanity_tables_present(&self) -> bool {
        self.bad_species.is_some()
            && self.bad_moves.is_some()
            && self.bad_items.is_some()
            && self.bad_text.is_some()
            && self.checks_maps.is_some()
    }

    /// True when the Japanese mail tables are present.
    pub fn japanese_tables_present(&self) -> bool {
        self.jp_mail_patch_set.is_some()
            && self.mail_en_to_jp.is_some()
            && self.mail_jp_to_en.is_some()
    }

    pub fn name(&self, species: u16) -> &str {
        self.names
            .get(species as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }

    pub fn base_pp(&self, move_id: u8) -> u8 {
        self.moves_pp.get(move_id as usize).copied().unwrap_or(0)
    }

    /// Species that may evolve or learn a move when traded.
    pub fn is_special_mon(&self, species: u8) -> bool {
        self.special_mons.contains(species)
    }

    /// Level implied by a cumulative EXP total, from the species' curve.
    /// Binary search for the highest level whose threshold is not above
    /// `exp`, clamped to [2, 100].
    pub fn level_for_exp(&self, species: u8, exp: u32) -> u8 {
        let group = self
            .exp_groups
            .get(species as usize)
            .copied()
            .unwrap_or(0) as usize;
        let Some(curve) = self.exp_curves.get(group) else {
            return 2;
        };
        let level = match curve.binary_search(&exp) {
            Ok(i) => i + 1,
            Err(0) => 1,
            Err(i) => i,
        };
        level.clamp(2, 100) as u8
    }

    /// Max cumulative EXP reachable by a species (its curve's level-100
    /// entry).
    pub fn max_exp(&self, species: u8) -> u32 {
        let group = self
            .exp_groups
            .get(species as usize)
            .copied()
            .unwrap_or(0) as usize;
        self.exp_curves
            .get(group)
            .and_then(|c| c.last().copied())
            .unwrap_or(u32::MAX)
    }
}

/// `checks_map.bin` concatenates one check index per byte position across
/// all sections; split it back by the generation's section lengths.
fn split_checks_map(raw: &[u8], generation: Generation) -> Result<Vec<Vec<u8>>, AppError> {
    let lengths = generation.section_lengths();
    let total: usize = lengths.iter().sum();
    if raw.len() != total {
        return Err(AppError::Data(format!(
            "checks map is {} bytes, expected {total}",
            raw.len()
        )));
    }
    let mut out = Vec::with_capacity(lengths.len());
    let mut off = 0;
    for &len in lengths {
        out.push(raw[off..off + len].to_vec());
        off += len;
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn exp_curve_line() -> String {
        // A strictly growing synthetic curve is enough for level lookups.
        (1..=100u32)
            .map(|l| (l * l * l).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Write a minimal but complete Gen 2 data root under `root`.
    pub fn write_gen2_root(root: &Path) {
        let dir = root.join("gsc");
        fs::create_dir_all(&dir).unwrap();
        let w = |name: &str, data: &[u8]| fs::write(dir.join(name), data).unwrap();
        w("stats.bin", &[50u8; 6 * 256]);
        w("pokemon_exp_groups.bin", &[0u8; 256]);
        fs::write(dir.join("pokemon_exp.txt"), format!("{}\n", exp_curve_line())).unwrap();
        fs::write(
            dir.join("pokemon_names.txt"),
            (0..256)
                .map(|i| format!("SPECIES{i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
        .unwrap();
        w("moves_pp_list.bin", &[35u8; 256]);
        w("egg_nick.bin", &[0x84, 0x86, 0x86, 0x50, 0x50]);
        fs::write(dir.join("text_conv.txt"), "80=A\nE6=?\n").unwrap();
        w("evolution_ids.bin", &[0x40, 0x00, 0x41]);
        w("learnset_evos.bin", &[0x40, 0xF9]);
        w("pokemon_patch_set_0.bin", &[0x01, 0x02, 0x03]);
        w("pokemon_patch_set_1.bin", &[0x01, 0x02]);
        w("mail_patch_set.bin", &[0x01]);
        w("no_mail_section.bin", &[0u8; 385]);
        w("base_random_section.bin", &[0xD1; 10]);
        // Sanity block.
        w("bad_ids_pokemon.bin", &[0x00, 0xFE, 0xFF]);
        w("bad_ids_moves.bin", &[0xFF]);
        w("bad_ids_items.bin", &[0xFF]);
        w("bad_ids_text.bin", &[0x00]);
        let total: usize = Generation::Two.section_lengths().iter().sum();
        w("checks_map.bin", &vec![0u8; total]);
        w("single_pokemon_checks_map.bin", &[0u8; 117]);
        w("moves_checks_map.bin", &[0u8; 8]);
    }

    /// Write a minimal Gen 3 data root under `root`.
    pub fn write_gen3_root(root: &Path) {
        let dir = root.join("rse");
        fs::create_dir_all(&dir).unwrap();
        let w = |name: &str, data: &[u8]| fs::write(dir.join(name), data).unwrap();
        w("stats.bin", &[60u8; 6 * 412]);
        w("pokemon_exp_groups.bin", &[0u8; 412]);
        fs::write(dir.join("pokemon_exp.txt"), format!("{}\n", exp_curve_line())).unwrap();
        fs::write(
            dir.join("pokemon_names.txt"),
            (0..412)
                .map(|i| format!("SPECIES{i}"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
        .unwrap();
        w("moves_pp_list.bin", &[30u8; 355]);
        w("egg_nick.bin", &[0xBF, 0xC1, 0xC1, 0xFF]);
        fs::write(dir.join("text_conv.txt"), "BB=A\nAC=?\n").unwrap();
        w("invalid_pokemon.bin", &[0x00, 0x00]);
        w("invalid_held_items.bin", &[0xFF, 0xFF]);
        w("abilities.bin", &[1u8; 2 * 412]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_gen2_root() {
        let root = TempDir::new().unwrap();
        testing::write_gen2_root(root.path());
        let t = StaticTables::load(root.path(), Generation::Two).unwrap();
        assert!(t.sanity_tables_present());
        assert!(!t.japanese_tables_present());
        assert!(t.is_special_mon(0xF9));
        assert!(!t.is_special_mon(0x10));
        assert_eq!(t.name(3), "SPECIES3");
        assert_eq!(t.checks_maps.as_ref().unwrap().len(), 4);
        assert_eq!(t.checks_maps.as_ref().unwrap()[1].len(), 444);
    }

    #[test]
    fn test_load_gen3_root() {
        let root = TempDir::new().unwrap();
        testing::write_gen3_root(root.path());
        let t = StaticTables::load(root.path(), Generation::Three).unwrap();
        assert!(t.invalid_species_g3.contains(&0));
        assert_eq!(t.abilities.len(), 412);
        assert!(!t.sanity_tables_present());
    }

    #[test]
    fn test_load_missing_root_fails() {
        let root = TempDir::new().unwrap();
        assert!(StaticTables::load(root.path(), Generation::Two).is_err());
    }

    #[test]
    fn test_sanity_block_optional() {
        let root = TempDir::new().unwrap();
        testing::write_gen2_root(root.path());
        std::fs::remove_file(root.path().join("gsc/bad_ids_pokemon.bin")).unwrap();
        let t = StaticTables::load(root.path(), Generation::Two).unwrap();
        assert!(!t.sanity_tables_present());
    }

    #[test]
    fn test_level_for_exp_binary_search() {
        let root = TempDir::new().unwrap();
        testing::write_gen2_root(root.path());
        let t = StaticTables::load(root.path(), Generation::Two).unwrap();
        // Curve is level^3.
        assert_eq!(t.level_for_exp(5, 8), 2);
        assert_eq!(t.level_for_exp(5, 26), 2);
        assert_eq!(t.level_for_exp(5, 27), 3);
        assert_eq!(t.level_for_exp(5, 1_000_000), 100);
        assert_eq!(t.level_for_exp(5, 0), 2);
    }

    #[test]
    fn test_max_exp() {
        let root = TempDir::new().unwrap();
        testing::write_gen2_root(root.path());
        let t = StaticTables::load(root.path(), Generation::Two).unwrap();
        assert_eq!(t.max_exp(5), 1_000_000);
    }
}
