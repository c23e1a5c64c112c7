//! per-key echo guard.
//!
//! after a local write to key K at time T, incoming updates for K are
//! discarded until `T + window`. it is a time heuristic, not causal ordering:
//! another writer's edit to K inside the window is dropped too.

use std::collections::HashMap;

pub const DEFAULT_ECHO_WINDOW_MS: u64 = 3_000;

#[derive(Debug)]
pub struct EchoSuppressor {
    window_ms: u64,
    last_local_write: HashMap<String, u64>,
}

impl EchoSuppressor {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms, last_local_write: HashMap::new() }
    }

    pub fn mark(&mut self, key: &str, now: u64) {
        self.last_local_write.insert(key.to_string(), now);
    }

    /// forget a key only if its window still belongs to the write marked at
    /// `marked_at`
    pub fn clear_if_marked_at(&mut self, key: &str, marked_at: u64) -> bool {
        if self.last_local_write.get(key) == Some(&marked_at) {
            self.last_local_write.remove(key);
            return true;
        }
        false
    }

    /// true while `now` is inside the key's window
    pub fn should_discard(&mut self, key: &str, now: u64) -> bool {
        match self.last_local_write.get(key) {
            Some(&written) if now < written.saturating_add(self.window_ms) => true,
            Some(_) => {
                self.last_local_write.remove(key);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_boundaries() {
        let mut echo = EchoSuppressor::new(DEFAULT_ECHO_WINDOW_MS);
        echo.mark("dev1:lifecycle", 10_000);

        assert!(echo.should_discard("dev1:lifecycle", 10_000));
        assert!(echo.should_discard("dev1:lifecycle", 12_999));
        assert!(!echo.should_discard("dev1:lifecycle", 13_000));
        // window is spent once it has passed
        assert!(!echo.should_discard("dev1:lifecycle", 10_500));
    }

    #[test]
    fn test_other_keys_unaffected() {
        let mut echo = EchoSuppressor::new(DEFAULT_ECHO_WINDOW_MS);
        echo.mark("dev1:drawer1:fan", 0);
        assert!(!echo.should_discard("dev1:drawer1:light", 1));
    }

    #[test]
    fn test_new_write_restarts_window() {
        let mut echo = EchoSuppressor::new(1_000);
        echo.mark("k", 0);
        echo.mark("k", 900);
        assert!(echo.should_discard("k", 1_500));
        assert!(echo.clear_if_marked_at("k", 900));
        assert!(!echo.should_discard("k", 1_500));
    }

    #[test]
    fn test_clear_only_removes_matching_mark() {
        let mut echo = EchoSuppressor::new(3_000);
        echo.mark("k", 100);
        echo.mark("k", 200);

        assert!(!echo.clear_if_marked_at("k", 100));
        assert!(echo.should_discard("k", 2_000));
        assert!(echo.clear_if_marked_at("k", 200));
        assert!(!echo.should_discard("k", 2_000));
    }
}
