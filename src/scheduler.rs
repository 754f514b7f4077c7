// src/scheduler.rs
//
// Явные запланированные задачи вместо разрозненных таймеров: каждая фоновая
// задача возвращает TaskHandle, отмена идемпотентна и происходит при Drop.
// Время берётся из tokio, поэтому тесты с `start_paused` управляют им через
// `tokio::time::advance`.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Источник «настенного» времени для меток created_at/timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Системные часы.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Часы, идущие вместе с часами tokio: на остановленном времени в тестах
/// метки сдвигаются ровно на `advance`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_wall: DateTime<Utc>,
    base_instant: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(base_wall: DateTime<Utc>) -> Self {
        Self {
            base_wall,
            base_instant: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.base_instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base_wall + elapsed
    }
}

/// Дескриптор фоновой задачи. `cancel` можно вызывать сколько угодно раз.
#[derive(Debug)]
pub struct TaskHandle {
    inner: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            inner: Mutex::new(Some(handle)),
        }
    }

    pub fn cancel(&self) {
        let handle = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Задача ещё не отменена и не завершилась сама.
    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Периодическая задача. Первый тик через `period` после старта;
/// `ControlFlow::Break` из тика завершает цикл.
pub fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tick().await.is_break() {
                break;
            }
        }
    });
    TaskHandle::new(handle)
}

/// Однократная задача через `delay`.
pub fn spawn_after<Fut>(delay: Duration, fut: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fut.await;
    });
    TaskHandle::new(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_after_each_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic(Duration::from_secs(30), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0, "no tick before first period");

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        handle.cancel();
        handle.cancel();
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2, "cancelled task must not tick");
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_stops_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Break(())
            }
        });
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_delayed_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        let handle = spawn_after(Duration::from_secs(2), async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        let after = clock.now();
        assert_eq!((after - before).num_seconds(), 90);
    }
}
