//! Packing object blocks into size-bounded messages

use crate::networking::packets::{ObjectPropertiesBlock, ObjectUpdateBlock, TerseUpdateBlock};
use crate::networking::NetworkError;
use std::collections::HashSet;
use tracing::warn;

/// Blocks per message are counted in one byte
const MAX_BLOCKS: usize = u8::MAX as usize;

pub(crate) trait Block {
    fn local_id(&self) -> u32;
    fn encoded_len(&self) -> usize;
}

impl Block for ObjectUpdateBlock {
    fn local_id(&self) -> u32 {
        self.local_id
    }

    fn encoded_len(&self) -> usize {
        ObjectUpdateBlock::encoded_len(self)
    }
}

impl Block for TerseUpdateBlock {
    fn local_id(&self) -> u32 {
        self.local_id
    }

    fn encoded_len(&self) -> usize {
        TerseUpdateBlock::encoded_len(self)
    }
}

/// Split blocks into batches whose body stays within `budget` bytes.
///
/// A batch is closed early when it reaches the block-count limit or when the
/// next block repeats an object already in it. Blocks too large to fit even
/// alone are dropped with a warning and counted in the second return value.
pub(crate) fn pack<B: Block, T>(
    items: Vec<(B, T)>,
    header_len: usize,
    budget: usize,
    message: &'static str,
) -> (Vec<Vec<(B, T)>>, usize) {
    let mut batches = Vec::new();
    let mut current: Vec<(B, T)> = Vec::new();
    let mut ids = HashSet::new();
    let mut size = header_len;
    let mut oversized = 0;

    for (block, extra) in items {
        let len = block.encoded_len();
        if header_len + len > budget {
            let error = NetworkError::SerializationFailure {
                message,
                reason: format!(
                    "object {} needs {} bytes, budget is {}",
                    block.local_id(),
                    header_len + len,
                    budget
                ),
            };
            warn!("Skipping update: {}", error);
            oversized += 1;
            continue;
        }

        let full = size + len > budget || current.len() == MAX_BLOCKS || ids.contains(&block.local_id());
        if full && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            ids.clear();
            size = header_len;
        }
        size += len;
        ids.insert(block.local_id());
        current.push((block, extra));
    }
    if !current.is_empty() {
        batches.push(current);
    }
    (batches, oversized)
}

/// Property blocks chunked by the same budget. Blocks that cannot fit alone are dropped.
pub(crate) fn pack_properties(blocks: Vec<ObjectPropertiesBlock>, budget: usize) -> Vec<Vec<ObjectPropertiesBlock>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 1;
    for block in blocks {
        let len = block.encoded_len();
        if 1 + len > budget {
            let error = NetworkError::SerializationFailure {
                message: "ObjectProperties",
                reason: format!("object {} needs {} bytes, budget is {}", block.object_id, 1 + len, budget),
            };
            warn!("Skipping properties: {}", error);
            continue;
        }
        if !current.is_empty() && (size + len > budget || current.len() == MAX_BLOCKS) {
            batches.push(std::mem::take(&mut current));
            size = 1;
        }
        size += len;
        current.push(block);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
