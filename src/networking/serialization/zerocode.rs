//! Second Life zerocoding implementation
//!
//! Zerocoding compresses runs of zero bytes in a message body. A run of `n`
//! zeros (1..=255) becomes the pair `0x00 n`; longer runs are split. Only the
//! body is ever coded: the header before it and appended acks after it are not.

use super::{CodecError, CodecResult};

/// Longest run a single marker pair can express
const MAX_RUN: usize = u8::MAX as usize;

/// Encode data using Second Life's zerocoding algorithm
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] != 0 {
            result.push(data[i]);
            i += 1;
            continue;
        }

        let run = data[i..].iter().take(MAX_RUN).take_while(|&&b| b == 0).count();
        result.push(0x00);
        result.push(run as u8);
        i += run;
    }

    result
}

/// Decode zerocoded data back to original format
pub fn decode(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        if data[i] != 0x00 {
            result.push(data[i]);
            i += 1;
            continue;
        }

        let count = match data.get(i + 1) {
            Some(&count) => count,
            None => {
                return Err(CodecError::MalformedField {
                    field: "zerocoded body".to_string(),
                    reason: "dangling zero marker at end of body".to_string(),
                })
            }
        };
        if count == 0 {
            return Err(CodecError::MalformedField {
                field: "zerocoded body".to_string(),
                reason: format!("zero-length run at offset {}", i),
            });
        }

        result.resize(result.len() + count as usize, 0);
        i += 2;
    }

    Ok(result)
}

/// Zerocoded form of `data`, but only when it is strictly shorter
pub fn encode_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if !data.contains(&0) {
        return None;
    }
    let encoded = encode(data);
    (encoded.len() < data.len()).then_some(encoded)
}
