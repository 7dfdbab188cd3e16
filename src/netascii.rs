//! Netascii line-ending translation (RFC 764 as used by RFC 1350).
//!
//! On the wire every line ends in `CR LF` and a bare carriage return is sent
//! as `CR NUL`. The host side uses `\n` line endings.

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Translates host bytes to netascii, appending to `out`.
pub fn encode_into(input: &[u8], out: &mut impl Extend<u8>) {
    for &b in input {
        match b {
            LF => out.extend([CR, LF]),
            CR => out.extend([CR, NUL]),
            _ => out.extend([b]),
        }
    }
}

/// Incremental netascii to host translation. A `CR` may end one chunk and its
/// partner byte begin the next, so the decoder carries that state across calls.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => {
                        out.push(LF);
                        continue;
                    }
                    NUL => {
                        out.push(CR);
                        continue;
                    }
                    _ => out.push(CR),
                }
            }
            if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        out
    }

    /// Flushes a trailing lone `CR`.
    pub fn finish(&mut self) -> Vec<u8> {
        if std::mem::take(&mut self.pending_cr) {
            vec![CR]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_line_endings() {
        let mut out = Vec::new();
        encode_into(b"a\nb\rc", &mut out);
        assert_eq!(out, b"a\r\nb\r\0c");
    }

    #[test]
    fn decodes_across_chunk_boundaries() {
        let mut decoder = Decoder::new();
        let mut host = decoder.decode(b"line one\r");
        host.extend(decoder.decode(b"\nbare\r"));
        host.extend(decoder.decode(b"\0end\r"));
        host.extend(decoder.finish());
        assert_eq!(host, b"line one\nbare\rend\r");
    }

    #[test]
    fn stray_cr_is_kept() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(b"a\rb"), b"a\rb");
    }
}
