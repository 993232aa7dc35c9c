/// Position-slot frames for synchronous section exchange.
///
/// Two wire formats coexist: the OLD format packs 2 slots behind a
/// leading section-index byte (7 bytes), the NEW format packs 8
/// self-describing slots (32 bytes). The format in use is auto-detected
/// from the first well-formed peer frame.

/// Slot position marking "no slot here" (frame padding).
pub const POS_BLANK: u16 = 0xFFFF;
/// Slot position announcing readiness for the slot's section.
pub const POS_READY: u16 = 0xFFFE;
/// Peer values at or above the section length are completion markers;
/// a value of 0xFE is a keep-alive, not data.
pub const VAL_KEEPALIVE: u8 = 0xFE;

pub const NEW_FRAME_LEN: usize = 32;
pub const OLD_FRAME_LEN: usize = 7;
pub const NEW_SLOTS: usize = 8;
pub const OLD_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub pos: u16,
    pub val: u8,
    pub section: u8,
}

impl Slot {
    pub fn blank() -> Self {
        Self {
            pos: POS_BLANK,
            val: 0,
            section: 0,
        }
    }

    pub fn ready(section: u8) -> Self {
        Self {
            pos: POS_READY,
            val: 0,
            section,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.pos == POS_BLANK
    }

    pub fn is_ready(&self) -> bool {
        self.pos == POS_READY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SngFormat {
    Old,
    New,
}

/// Encode up to 8 slots in the NEW 32-byte format, padding with blanks.
pub fn encode_new(slots: &[Slot]) -> Vec<u8> {
    debug_assert!(slots.len() <= NEW_SLOTS);
    let mut out = Vec::with_capacity(NEW_FRAME_LEN);
    for i in 0..NEW_SLOTS {
        let slot = slots.get(i).copied().unwrap_or_else(Slot::blank);
        out.extend_from_slice(&slot.pos.to_be_bytes());
        out.push(slot.val);
        out.push(slot.section);
    }
    out
}

/// Encode up to 2 slots in the OLD 7-byte format. All slots share the
/// frame's section index.
pub fn encode_old(section: u8, slots: &[Slot]) -> Vec<u8> {
    debug_assert!(slots.len() <= OLD_SLOTS);
    let mut out = Vec::with_capacity(OLD_FRAME_LEN);
    out.push(section);
    for i in 0..OLD_SLOTS {
        let slot = slots.get(i).copied().unwrap_or_else(Slot::blank);
        out.extend_from_slice(&slot.pos.to_be_bytes());
        out.push(slot.val);
    }
    out
}

pub fn encode(format: SngFormat, section: u8, slots: &[Slot]) -> Vec<u8> {
    match format {
        SngFormat::New => encode_new(slots),
        SngFormat::Old => encode_old(section, slots),
    }
}

/// Identify the frame format from its length.
pub fn detect(raw: &[u8]) -> Option<SngFormat> {
    match raw.len() {
        NEW_FRAME_LEN => Some(SngFormat::New),
        OLD_FRAME_LEN => Some(SngFormat::Old),
        _ => None,
    }
}

/// Decode a frame of either format into its non-blank slots.
pub fn decode(raw: &[u8]) -> Option<Vec<Slot>> {
    match detect(raw)? {
        SngFormat::New => {
            let slots = raw
                .chunks_exact(4)
                .map(|c| Slot {
                    pos: u16::from_be_bytes([c[0], c[1]]),
                    val: c[2],
                    section: c[3],
                })
                .filter(|s| !s.is_blank())
                .collect();
            Some(slots)
        }
        SngFormat::Old => {
            let section = raw[0];
            let slots = raw[1..]
                .chunks_exact(3)
                .map(|c| Slot {
                    pos: u16::from_be_bytes([c[0], c[1]]),
                    val: c[2],
                    section,
                })
                .filter(|s| !s.is_blank())
                .collect();
            Some(slots)
        }
    }
}

/// How many data slots fit per frame in the given format.
pub fn slots_per_frame(format: SngFormat) -> usize {
    match format {
        SngFormat::New => NEW_SLOTS,
        SngFormat::Old => OLD_SLOTS,
    }
}
