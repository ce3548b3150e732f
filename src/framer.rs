use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Pure codec between records-as-bytes and the framed byte stream. Packing
/// prefixes a payload with the header magic and a length field; unpacking
/// splits complete payloads out of an accumulating residue buffer, resilient
/// to partial reads and to garbage between frames.
#[derive(Debug, Clone)]
pub struct Framer {
    header: Vec<u8>,
}

impl Framer {
    /// The header must be a non-empty ASCII string; [crate::config::NodeConfig::validate]
    /// enforces this before a node starts.
    pub fn new(header: &str) -> Framer {
        Framer {
            header: header.as_bytes().to_vec(),
        }
    }

    /// `HEADER ‖ u32 BE length ‖ payload`. Deterministic: byte-identical
    /// payloads produce byte-identical frames.
    pub fn pack(&self, payload: &[u8]) -> anyhow::Result<BytesMut> {
        let Ok(len) = u32::try_from(payload.len()) else {
            bail!("payload of {} bytes does not fit the frame length field", payload.len());
        };

        let mut buf = BytesMut::with_capacity(self.header.len() + 4 + payload.len());
        buf.put_slice(&self.header);
        buf.put_u32(len);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Splits all complete payloads out of `residue`, leaving the unconsumed
    /// tail in place for the next call.
    ///
    /// Bytes preceding the first header occurrence are unrecoverable garbage
    /// and are dropped. If no header is present at all, only the last
    /// `len(header) - 1` bytes are retained - a shorter suffix may still be
    /// the start of a header whose remainder is in flight.
    pub fn unpack(&self, residue: &mut BytesMut) -> Vec<Bytes> {
        let mut payloads = Vec::new();

        loop {
            let Some(start) = find(residue, &self.header) else {
                let keep = residue.len().min(self.header.len() - 1);
                residue.advance(residue.len() - keep);
                return payloads;
            };
            residue.advance(start);

            if residue.len() < self.header.len() + 4 {
                return payloads;
            }
            let h = self.header.len();
            let len = u32::from_be_bytes([residue[h], residue[h + 1], residue[h + 2], residue[h + 3]]) as usize;
            if residue.len() < h + 4 + len {
                return payloads;
            }

            residue.advance(h + 4);
            payloads.push(residue.split_to(len).freeze());
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
