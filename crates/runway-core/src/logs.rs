// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase log chunks.
//!
//! A phase's output is streamed as a sequence of chunks keyed by
//! `(run_id, phase, offset)`, where `offset` is the byte position of the
//! chunk within the phase's stream. The first chunk of a stream begins with
//! [`START_MARKER`] and the last ends with [`END_MARKER`]; consumers
//! concatenate chunks in offset order and strip the markers.

use serde::{Deserialize, Serialize};

use crate::run::PhaseKind;

/// Prefix of the first chunk of a phase's log stream.
pub const START_MARKER: u8 = 0x02;

/// Suffix of the last chunk of a phase's log stream.
pub const END_MARKER: u8 = 0x03;

/// A slice of a phase's log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Run the output belongs to.
    pub run_id: String,
    /// Phase the output belongs to.
    pub phase: PhaseKind,
    /// Byte position of this chunk within the stream.
    pub offset: i64,
    /// Raw bytes, including any marker.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Whether this chunk opens the stream.
    pub fn is_start(&self) -> bool {
        self.data.first() == Some(&START_MARKER)
    }

    /// Whether this chunk closes the stream.
    pub fn is_end(&self) -> bool {
        self.data.last() == Some(&END_MARKER)
    }

    /// Offset of the byte following this chunk.
    pub fn next_offset(&self) -> i64 {
        self.offset + self.data.len() as i64
    }
}

/// A chunk as stored, with its storage-assigned ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChunk {
    /// Storage identifier.
    pub id: i64,
    /// The chunk.
    #[serde(flatten)]
    pub chunk: Chunk,
}

/// Concatenate chunks in offset order and strip the stream markers.
pub fn reassemble<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Vec<u8> {
    let mut ordered: Vec<&Chunk> = chunks.into_iter().collect();
    ordered.sort_by_key(|c| c.offset);

    let mut out: Vec<u8> = ordered.iter().flat_map(|c| c.data.iter().copied()).collect();
    if out.first() == Some(&START_MARKER) {
        out.remove(0);
    }
    if out.last() == Some(&END_MARKER) {
        out.pop();
    }
    out
}

/// Whether a set of chunks holds a complete, gap-free stream.
pub fn is_complete<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> bool {
    let mut ordered: Vec<&Chunk> = chunks.into_iter().collect();
    ordered.sort_by_key(|c| c.offset);

    let (Some(first), Some(last)) = (ordered.first(), ordered.last()) else {
        return false;
    };
    if first.offset != 0 || !first.is_start() || !last.is_end() {
        return false;
    }
    ordered
        .windows(2)
        .all(|pair| pair[0].next_offset() == pair[1].offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: i64, data: &[u8]) -> Chunk {
        Chunk {
            run_id: "run-1".to_string(),
            phase: PhaseKind::Plan,
            offset,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_reassemble_orders_by_offset_and_strips_markers() {
        let chunks = vec![
            chunk(8, b" world\x03"),
            chunk(0, b"\x02hello"),
            chunk(6, b", "),
        ];
        assert_eq!(reassemble(&chunks), b"hello,  world".to_vec());
    }

    #[test]
    fn test_markers() {
        let first = chunk(0, b"\x02plan");
        let last = chunk(5, b"done\x03");
        assert!(first.is_start());
        assert!(!first.is_end());
        assert!(last.is_end());
        assert_eq!(first.next_offset(), 5);
    }

    #[test]
    fn test_is_complete() {
        let chunks = vec![chunk(0, b"\x02ab"), chunk(3, b"cd\x03")];
        assert!(is_complete(&chunks));

        let gap = vec![chunk(0, b"\x02ab"), chunk(4, b"cd\x03")];
        assert!(!is_complete(&gap));

        let open = vec![chunk(0, b"\x02ab")];
        assert!(!is_complete(&open));

        assert!(!is_complete(&Vec::<Chunk>::new()));
    }
}
