// Topic observer for post-commit notifications. Subscribers run after the
// write has landed and cannot fail it.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::block::Block;

/// Topic fired after a block and its transactions are committed.
pub const EVENT_BLOCK_SAVED: &str = "bk-saved";

type Subscriber = Box<dyn Fn(&Block) + Send + Sync>;

pub struct BlockObserver {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl BlockObserver {
    pub fn new() -> BlockObserver {
        BlockObserver {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&Block) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    pub fn trigger(&self, topic: &str, block: &Block) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get(topic) {
            for callback in list {
                callback(block);
            }
        }
    }
}

impl Default for BlockObserver {
    fn default() -> Self {
        Self::new()
    }
}
