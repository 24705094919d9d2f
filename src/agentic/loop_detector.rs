//! Detection of tool calls that go round in circles.

use std::collections::VecDeque;

use serde_json::Value;
use sha2::{Digest, Sha256};

const MAX_HISTORY: usize = 20;
const PATTERN_WINDOW: usize = 10;
const MIN_PATTERN_HISTORY: usize = 6;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    input_hash: String,
}

/// Short digest of a tool input: the first 8 bytes of its SHA-256, hex.
fn input_hash(input: &Value) -> String {
    let digest = Sha256::digest(input.to_string().as_bytes());
    hex::encode(&digest[..8])
}

/// Per-execution record of recent tool calls.
#[derive(Debug, Default)]
pub struct LoopDetector {
    history: VecDeque<Entry>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a call identical (name and input) to one already recorded.
    pub fn check(&self, name: &str, input: &Value) -> Option<String> {
        let hash = input_hash(input);
        let previous = self
            .history
            .iter()
            .filter(|e| e.name == name && e.input_hash == hash)
            .count();
        (previous > 0).then(|| {
            format!(
                "Tool call loop detected ({} called {} times with same input). Please try a different approach.",
                name,
                previous + 1
            )
        })
    }

    pub fn record(&mut self, name: &str, input: &Value) {
        self.history.push_back(Entry {
            name: name.to_string(),
            input_hash: input_hash(input),
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    /// Flag a cycle of 2 to 4 tool names repeating at least three times
    /// over the most recent calls.
    pub fn detect_pattern(&self) -> Option<String> {
        if self.history.len() < MIN_PATTERN_HISTORY {
            return None;
        }
        let skip = self.history.len().saturating_sub(PATTERN_WINDOW);
        let recent: Vec<&str> = self.history.iter().skip(skip).map(|e| e.name.as_str()).collect();

        (2..=4).find_map(|len| {
            has_repeating_pattern(&recent, len).then(|| {
                format!(
                    "Repeating tool pattern detected ({}). Consider a different strategy.",
                    recent[..len].join("→")
                )
            })
        })
    }
}

fn has_repeating_pattern(names: &[&str], len: usize) -> bool {
    if names.len() < len * 3 {
        return false;
    }
    let pattern = &names[..len];
    let mut cycles = 1;
    for (i, name) in names.iter().enumerate().skip(len) {
        let idx = i % len;
        if *name != pattern[idx] {
            return false;
        }
        if idx == len - 1 {
            cycles += 1;
        }
    }
    cycles >= 3
}
