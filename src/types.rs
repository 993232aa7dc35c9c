use serde::{Deserialize, Serialize};

/// Cartridge generation being traded with. Each generation has its own
/// section layout, on-wire byte protocol, and peer tag suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    One,
    Two,
    Three,
}

impl Generation {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }

    /// Fixed per-section byte lengths for a party transfer.
    pub fn section_lengths(self) -> &'static [usize] {
        match self {
            Self::One => &[10, 418, 197],
            Self::Two => &[10, 444, 197, 385],
            Self::Three => &[0x380],
        }
    }

    /// Subdirectory of the data root holding this generation's tables.
    pub fn data_dir(self) -> &'static str {
        match self {
            Self::One => "rby",
            Self::Two => "gsc",
            Self::Three => "rse",
        }
    }

    /// Build a 4-character peer tag from a 3-character family, e.g.
    /// `CHC` → `CHC2`. Gen 3 tags are spelled out in full by callers
    /// (`CH3S`, `A3S1`, ...) and never go through here.
    pub fn tag(self, family: &str) -> [u8; 4] {
        debug_assert_eq!(family.len(), 3);
        let digit = match self {
            Self::One => b'1',
            Self::Two => b'2',
            Self::Three => b'3',
        };
        let f = family.as_bytes();
        [f[0], f[1], f[2], digit]
    }

    /// Replacement species for a bad species byte (Rattata).
    pub fn default_species(self) -> u8 {
        match self {
            Self::One => 0xA5, // Gen 1 internal index order
            Self::Two | Self::Three => 0x13,
        }
    }
}

/// How peer party data travels relative to the cartridge's own section
/// transfer: interleaved per byte, or as one blob up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeMode {
    Synchronous,
    Buffered,
}

impl TradeMode {
    pub fn wire_byte(self) -> u8 {
        match self {
            Self::Synchronous => 0x12,
            Self::Buffered => 0x85,
        }
    }

    pub fn from_wire_byte(b: u8) -> Option<Self> {
        match b {
            0x12 => Some(Self::Synchronous),
            0x85 => Some(Self::Buffered),
            _ => None,
        }
    }
}

/// Who sits on the other end of the relay room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeTarget {
    /// A second player's client.
    Link,
    /// The server-side Pokémon pool.
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Completed,
    Declined,
    Cancelled,
}

/// One line of session history, logged after every menu cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: i64,
    pub generation: Generation,
    pub sent_species: u16,
    pub received_species: u16,
    pub outcome: TradeOutcome,
}

impl TradeRecord {
    pub fn new(
        generation: Generation,
        sent_species: u16,
        received_species: u16,
        outcome: TradeOutcome,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            generation,
            sent_species,
            received_species,
            outcome,
        }
    }
}
