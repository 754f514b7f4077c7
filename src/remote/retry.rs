// src/remote/retry.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::RealtimeConfig;

/// Счетчик повторных попыток по имени канала.
#[derive(Debug, Clone, Default)]
pub struct RetryCounter {
    counters: Arc<Mutex<HashMap<String, u32>>>,
}

impl RetryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Увеличивает счетчик для данного канала и возвращает новое значение.
    pub async fn increment(&self, key: &str) -> u32 {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Возвращает текущее значение счетчика для данного канала.
    pub async fn get(&self, key: &str) -> u32 {
        let counters = self.counters.lock().await;
        *counters.get(key).unwrap_or(&0)
    }

    /// Удаляет счетчик (после успешной доставки).
    pub async fn remove(&self, key: &str) {
        let mut counters = self.counters.lock().await;
        counters.remove(key);
    }
}

/// Фиксированная задержка перед переподпиской и предел попыток подряд.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl ResubscribePolicy {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            backoff: config.resubscribe_backoff(),
            max_attempts: config.max_resubscribe_attempts,
        }
    }

    /// Задержка перед попыткой номер `attempt` (с 1) или `None`, если лимит исчерпан.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            None
        } else {
            Some(self.backoff)
        }
    }
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self::from_config(&RealtimeConfig::default())
    }
}
