//! Output selection by pull mode.

use rand::seq::SliceRandom;
use serde_json::Value;

use crate::types::PullMode;

/// Values picked for one activation and the cursor to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub values: Vec<Value>,
    pub next_cursor: u64,
}

/// Pick output values from `collection`.
///
/// `Circling` takes the element at `cursor` (wrapping) and advances by one;
/// `Random` takes one uniformly; `Broadcast` takes everything. An empty
/// collection selects nothing and leaves the cursor alone.
pub fn select(mode: PullMode, collection: &[Value], cursor: u64) -> Selection {
    if collection.is_empty() {
        return Selection {
            values: Vec::new(),
            next_cursor: cursor,
        };
    }
    match mode {
        PullMode::Random => Selection {
            values: collection
                .choose(&mut rand::thread_rng())
                .cloned()
                .into_iter()
                .collect(),
            next_cursor: cursor,
        },
        PullMode::Circling => {
            let len = collection.len() as u64;
            let index = cursor % len;
            Selection {
                values: vec![collection[index as usize].clone()],
                next_cursor: (index + 1) % len,
            }
        }
        PullMode::Broadcast => Selection {
            values: collection.to_vec(),
            next_cursor: cursor,
        },
    }
}
