/// 0xFE-escape patch sets.
///
/// The cartridge wire protocol cannot carry 0xFE inside data (it doubles
/// as a keep-alive), so serialization rewrites every 0xFE to 0xFF and
/// records its position in a side-channel patch list the receiver replays.
/// Offsets are 1-based within a 0xFC-byte page; a 0xFF byte in the list
/// advances to the next page, and the final 0xFF terminates it.
pub const PAGE: usize = 0xFC;
pub const ESCAPED: u8 = 0xFE;
pub const REPLACEMENT: u8 = 0xFF;
pub const PAGE_END: u8 = 0xFF;

/// Rewrite 0xFE bytes in `data` to 0xFF, returning the patch list that
/// restores them.
pub fn encode_patches(data: &mut [u8]) -> Vec<u8> {
    let mut patches = Vec::new();
    let pages = data.len() / PAGE + 1;
    for page in 0..pages {
        let start = page * PAGE;
        let end = (start + PAGE).min(data.len());
        for i in start..end {
            if data[i] == ESCAPED {
                data[i] = REPLACEMENT;
                patches.push((i - start + 1) as u8);
            }
        }
        patches.push(PAGE_END);
    }
    patches
}

/// Replay a patch list over `data`, restoring 0xFE at the recorded
/// positions. Tolerates short or over-long lists; offsets that fall
/// outside the buffer are ignored.
pub fn apply_patches(data: &mut [u8], patches: &[u8]) {
    let mut page_base = 0usize;
    for &b in patches {
        if b == PAGE_END {
            page_base += PAGE;
            if page_base >= data.len() {
                break;
            }
            continue;
        }
        // 0x00 is the validator's "no conversion" substitute.
        if b == 0 {
            continue;
        }
        let pos = page_base + (b as usize) - 1;
        if let Some(slot) = data.get_mut(pos) {
            *slot = ESCAPED;
        }
    }
}
