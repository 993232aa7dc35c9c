use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::AppError;

/// 256-wide membership bitmap built from a byte list on disk.
/// Bad-ID files enumerate the *invalid* values; patch-set files enumerate
/// the *allowed* conversion offsets. Same container either way.
#[derive(Debug, Clone)]
pub struct IdBitmap {
    bits: [bool; 256],
}

impl IdBitmap {
    pub fn empty() -> Self {
        Self { bits: [false; 256] }
    }

    pub fn from_byte_list(bytes: &[u8]) -> Self {
        let mut bits = [false; 256];
        for &b in bytes {
            bits[b as usize] = true;
        }
        Self { bits }
    }

    pub fn contains(&self, id: u8) -> bool {
        self.bits[id as usize]
    }
}

pub fn read_required(path: &Path) -> Result<Vec<u8>, AppError> {
    std::fs::read(path).map_err(|e| AppError::Data(format!("{}: {e}", path.display())))
}

pub fn read_optional(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

pub fn read_required_text(path: &Path) -> Result<String, AppError> {
    std::fs::read_to_string(path).map_err(|e| AppError::Data(format!("{}: {e}", path.display())))
}

/// `stats.bin`: six base-stat bytes per species, species-indexed from 0.
pub fn parse_base_stats(raw: &[u8]) -> Result<Vec<[u8; 6]>, AppError> {
    if raw.len() % 6 != 0 {
        return Err(AppError::Data(format!(
            "stats table length {} not a multiple of 6",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(6)
        .map(|c| [c[0], c[1], c[2], c[3], c[4], c[5]])
        .collect())
}

/// `pokemon_exp.txt`: one EXP group per line, 100 whitespace-separated
/// cumulative totals (one per level).
pub fn parse_exp_curves(text: &str) -> Result<Vec<Vec<u32>>, AppError> {
    let mut curves = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let curve: Result<Vec<u32>, _> = line.split_whitespace().map(str::parse).collect();
        let curve = curve.map_err(|e| AppError::Data(format!("exp curve line {}: {e}", i + 1)))?;
        if curve.len() != 100 {
            return Err(AppError::Data(format!(
                "exp curve line {} has {} levels, expected 100",
                i + 1,
                curve.len()
            )));
        }
        curves.push(curve);
    }
    Ok(curves)
}

/// `evolution_ids.bin`: (species, required-item-or-0, evolved-species)
/// triples for trade evolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvolutionRule {
    pub from: u8,
    pub item: u8,
    pub to: u8,
}

pub fn parse_evolutions(raw: &[u8]) -> Result<Vec<EvolutionRule>, AppError> {
    if raw.len() % 3 != 0 {
        return Err(AppError::Data(format!(
            "evolution table length {} not a multiple of 3",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(3)
        .map(|c| EvolutionRule {
            from: c[0],
            item: c[1],
            to: c[2],
        })
        .collect())
}

/// `pokemon_names.txt`: one ASCII name per line, species-indexed.
pub fn parse_names(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end().to_string()).collect()
}

/// `text_conv.txt`: `XX=c` per line, mapping an in-game text byte (hex) to
/// a display character.
pub fn parse_text_table(text: &str) -> Result<HashMap<u8, char>, AppError> {
    let mut table = HashMap::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (hex, ch) = line
            .split_once('=')
            .ok_or_else(|| AppError::Data(format!("text table line {}: missing '='", i + 1)))?;
        let byte = u8::from_str_radix(hex.trim(), 16)
            .map_err(|e| AppError::Data(format!("text table line {}: {e}", i + 1)))?;
        let ch = ch
            .chars()
            .next()
            .ok_or_else(|| AppError::Data(format!("text table line {}: empty char", i + 1)))?;
        table.insert(byte, ch);
    }
    Ok(table)
}

/// `abilities.bin`: two ability ids per species (Gen 3).
pub fn parse_abilities(raw: &[u8]) -> Result<Vec<[u8; 2]>, AppError> {
    if raw.len() % 2 != 0 {
        return Err(AppError::Data(format!(
            "abilities table length {} not a multiple of 2",
            raw.len()
        )));
    }
    Ok(raw.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
}

/// `invalid_pokemon.bin` / `invalid_held_items.bin` (Gen 3): u16 LE ids.
pub fn parse_u16_set(raw: &[u8]) -> Result<HashSet<u16>, AppError> {
    if raw.len() % 2 != 0 {
        return Err(AppError::Data(format!(
            "u16 id list length {} not a multiple of 2",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// `mail_conversion_table_*.bin`: full 256-entry byte substitution.
pub fn parse_byte_substitution(raw: &[u8]) -> Result<[u8; 256], AppError> {
    raw.try_into()
        .map_err(|_| AppError::Data(format!("substitution table length {} != 256", raw.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_from_byte_list() {
        let map = IdBitmap::from_byte_list(&[0x00, 0xFE, 0x10]);
        assert!(map.contains(0x00));
        assert!(map.contains(0xFE));
        assert!(map.contains(0x10));
        assert!(!map.contains(0x11));
    }

    #[test]
    fn test_parse_base_stats() {
        let raw = [10, 20, 30, 40, 50, 60, 1, 2, 3, 4, 5, 6];
        let stats = parse_base_stats(&raw).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1], [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parse_base_stats_rejects_ragged_input() {
        assert!(parse_base_stats(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_parse_exp_curves() {
        let line: String = (1..=100)
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("{line}\n{line}\n");
        let curves = parse_exp_curves(&text).unwrap();
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0][0], 1);
        assert_eq!(curves[0][99], 100);
    }

    #[test]
    fn test_parse_exp_curves_rejects_short_line() {
        assert!(parse_exp_curves("1 2 3\n").is_err());
    }

    #[test]
    fn test_parse_evolutions() {
        let rules = parse_evolutions(&[0x40, 0x00, 0x41, 0x5C, 0x8F, 0x5D]).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[1],
            EvolutionRule {
                from: 0x5C,
                item: 0x8F,
                to: 0x5D
            }
        );
    }

    #[test]
    fn test_parse_text_table() {
        let table = parse_text_table("80=A\n81=B\n\n# comment\nE6=?\n").unwrap();
        assert_eq!(table.get(&0x80), Some(&'A'));
        assert_eq!(table.get(&0xE6), Some(&'?'));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_parse_u16_set() {
        let set = parse_u16_set(&[0x9C, 0x01, 0x00, 0x00]).unwrap();
        assert!(set.contains(&412));
        assert!(set.contains(&0));
        assert!(!set.contains(&1));
    }

    #[test]
    fn test_parse_byte_substitution_requires_full_table() {
        assert!(parse_byte_substitution(&[0u8; 255]).is_err());
        let table: Vec<u8> = (0..=255).collect();
        let parsed = parse_byte_substitution(&table).unwrap();
        assert_eq!(parsed[0x42], 0x42);
    }
}
