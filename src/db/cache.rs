// src/db/cache.rs

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

/// Тип кэша строковых значений ключ-значение поверх SQLite.
pub type ValueCache = LruCache<String, String>;

/// Структура для управления LRU-кэшем чтения. Клонируется дёшево: все копии
/// разделяют одно хранилище.
#[derive(Clone)]
pub struct CacheHandler {
    pub value_cache: Arc<Mutex<ValueCache>>,
}

impl CacheHandler {
    /// Создаёт новый кэш с заданной ёмкостью (0 трактуется как 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            value_cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Пытается получить значение по ключу из кэша
    pub fn get_value(&self, key: &str) -> Option<String> {
        let mut cache = self.value_cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).cloned()
    }

    /// Добавляет или обновляет значение в кэше
    pub fn put_value(&self, key: &str, value: &str) {
        let mut cache = self.value_cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put(key.to_string(), value.to_string());
    }

    pub fn invalidate(&self, key: &str) {
        let mut cache = self.value_cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.pop(key);
    }

    pub fn clear(&self) {
        self.value_cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.value_cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
