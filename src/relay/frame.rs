/// Relay wire framing, one frame per WebSocket binary message.
///
/// `S tag[4] len:u16BE payload` publishes the latest value for a tag;
/// `G tag[4]` asks the room for the latest value of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Set { tag: [u8; 4], payload: Vec<u8> },
    Get { tag: [u8; 4] },
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Set { tag, payload } => {
                let mut out = Vec::with_capacity(7 + payload.len());
                out.push(b'S');
                out.extend_from_slice(tag);
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
            Self::Get { tag } => {
                let mut out = Vec::with_capacity(5);
                out.push(b'G');
                out.extend_from_slice(tag);
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        match raw.first()? {
            b'S' => {
                if raw.len() < 7 {
                    return None;
                }
                let tag = [raw[1], raw[2], raw[3], raw[4]];
                let len = u16::from_be_bytes([raw[5], raw[6]]) as usize;
                if raw.len() != 7 + len {
                    return None;
                }
                Some(Self::Set {
                    tag,
                    payload: raw[7..].to_vec(),
                })
            }
            b'G' => {
                if raw.len() != 5 {
                    return None;
                }
                Some(Self::Get {
                    tag: [raw[1], raw[2], raw[3], raw[4]],
                })
            }
            _ => None,
        }
    }
}

pub fn tag_str(tag: &[u8; 4]) -> String {
    tag.iter().map(|&b| b as char).collect()
}
