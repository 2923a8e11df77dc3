//! LLUDP zerocoding
//!
//! Zerocoding compresses runs of zero bytes: a run of N zeros (1..=255) is
//! written as `0x00 N`. Longer runs are split into several pairs.

use crate::networking::{NetworkError, NetworkResult};

/// Encode data using the zero run-length scheme
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0 {
            let mut run = 0usize;
            while i < data.len() && data[i] == 0 && run < u8::MAX as usize {
                run += 1;
                i += 1;
            }
            result.push(0x00);
            result.push(run as u8);
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    result
}

/// Decode zerocoded data back to original format
pub fn decode(data: &[u8]) -> NetworkResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0x00 {
            let Some(&run) = data.get(i + 1) else {
                return Err(NetworkError::malformed("Truncated zerocode sequence"));
            };
            result.resize(result.len() + run as usize, 0x00);
            i += 2;
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    Ok(result)
}
