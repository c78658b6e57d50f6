//! Hexdump formatting for crafted wire traffic.
//!
//! Enabled by the `hexdump` config flag; every emitted chunk is dumped
//! to the debug log, 16 bytes per line.

/// Format `data` as classic offset/hex/ascii dump lines.
pub fn lines(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            format!("{:08x}  {:<47}  |{}|", i * 16, hex.join(" "), ascii)
        })
        .collect()
}
