// src/sync/realtime.rs
//
// Подписки под надзором: при ошибке транспорта подписка пересоздаётся после
// паузы, число попыток подряд ограничено. Счётчик сбрасывается, когда по
// подписке снова пришли данные.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::db::monitoring::RESUBSCRIBES;
use crate::remote::feed::{ChangeEvent, ChangeFeed, FeedMessage, FeedSpec, FeedSubscription};
use crate::remote::presence::{PresenceChannel, PresenceEvent, PresenceHandle, PresenceTransport};
use crate::remote::retry::{ResubscribePolicy, RetryCounter};
use crate::scheduler::TaskHandle;

/// Ждёт паузу перед следующей попыткой; `false`, если лимит исчерпан.
async fn backoff(kind: &str, label: &str, policy: &ResubscribePolicy, retries: &RetryCounter) -> bool {
    let attempt = retries.increment(label).await;
    match policy.delay_for(attempt) {
        Some(delay) => {
            RESUBSCRIBES.with_label_values(&[kind]).inc();
            debug!("{} {} resubscribing in {:?} (attempt {})", kind, label, delay, attempt);
            tokio::time::sleep(delay).await;
            true
        }
        None => {
            error!("{} {} gave up after {} attempts", kind, label, attempt - 1);
            false
        }
    }
}

/// Подписка на ленту изменений. Первая попытка выполняется до возврата, так что
/// после `await` изменения уже доставляются.
pub async fn supervise_feed<H, Fut>(
    feed: Arc<dyn ChangeFeed>,
    spec: FeedSpec,
    label: String,
    policy: ResubscribePolicy,
    retries: RetryCounter,
    mut handler: H,
) -> TaskHandle
where
    H: FnMut(ChangeEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send,
{
    let mut current: Option<FeedSubscription> = match feed.subscribe(spec.clone()).await {
        Ok(sub) => Some(sub),
        Err(e) => {
            warn!("feed {} subscribe failed: {}", label, e);
            None
        }
    };

    TaskHandle::new(tokio::spawn(async move {
        loop {
            if let Some(mut sub) = current.take() {
                loop {
                    match sub.events.recv().await {
                        Some(FeedMessage::Change(event)) => {
                            retries.remove(&label).await;
                            if handler(event).await.is_break() {
                                return;
                            }
                        }
                        Some(FeedMessage::Error(reason)) => {
                            warn!("feed {} error: {}", label, reason);
                            break;
                        }
                        None => {
                            warn!("feed {} closed by transport", label);
                            break;
                        }
                    }
                }
            }
            if !backoff("feed", &label, &policy, &retries).await {
                return;
            }
            match feed.subscribe(spec.clone()).await {
                Ok(sub) => current = Some(sub),
                Err(e) => warn!("feed {} subscribe failed: {}", label, e),
            }
        }
    }))
}

/// Канал присутствия. `on_join` получает каждый новый канал (первый и после
/// переподключения), чтобы владелец мог публиковать состояние и рассылать события.
pub async fn supervise_presence<J, JFut, E, EFut>(
    transport: Arc<dyn PresenceTransport>,
    channel: String,
    key: String,
    policy: ResubscribePolicy,
    retries: RetryCounter,
    mut on_join: J,
    mut on_event: E,
) -> TaskHandle
where
    J: FnMut(Arc<dyn PresenceChannel>) -> JFut + Send + 'static,
    JFut: Future<Output = ()> + Send,
    E: FnMut(PresenceEvent) -> EFut + Send + 'static,
    EFut: Future<Output = ControlFlow<()>> + Send,
{
    let mut current: Option<PresenceHandle> = match transport.join(&channel, &key).await {
        Ok(handle) => {
            on_join(handle.channel.clone()).await;
            Some(handle)
        }
        Err(e) => {
            warn!("presence {} join failed: {}", channel, e);
            None
        }
    };

    TaskHandle::new(tokio::spawn(async move {
        loop {
            if let Some(mut handle) = current.take() {
                loop {
                    match handle.events.recv().await {
                        Some(PresenceEvent::Error(reason)) => {
                            warn!("presence {} error: {}", channel, reason);
                            break;
                        }
                        Some(event) => {
                            // Sync приходит на каждый join и живость канала не подтверждает
                            if !matches!(event, PresenceEvent::Sync(_)) {
                                retries.remove(&channel).await;
                            }
                            if on_event(event).await.is_break() {
                                return;
                            }
                        }
                        None => {
                            warn!("presence {} closed by transport", channel);
                            break;
                        }
                    }
                }
                if let Err(e) = handle.channel.leave().await {
                    debug!("presence {} leave after error failed: {}", channel, e);
                }
            }
            if !backoff("presence", &channel, &policy, &retries).await {
                return;
            }
            match transport.join(&channel, &key).await {
                Ok(handle) => {
                    on_join(handle.channel.clone()).await;
                    current = Some(handle);
                }
                Err(e) => warn!("presence {} join failed: {}", channel, e),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Table;
    use crate::remote::feed::EventFilter;
    use crate::remote::memory::MemoryBackend;
    use crate::remote::store::RemoteStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn policy(max_attempts: u32) -> ResubscribePolicy {
        ResubscribePolicy {
            backoff: Duration::from_secs(5),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_resubscribes_after_backoff() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _task = supervise_feed(
            Arc::new(backend.clone()),
            FeedSpec::new(Table::Messages, EventFilter::Insert),
            "messages".into(),
            policy(3),
            RetryCounter::new(),
            move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ControlFlow::Continue(())
                }
            },
        )
        .await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 1);

        backend.fail_feeds("socket closed");
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 0);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 0, "still backing off");

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 1);

        backend
            .insert(Table::Messages, vec![json!({"content": "after reconnect"})])
            .await
            .unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_gives_up_after_max_attempts() {
        let backend = MemoryBackend::new();
        backend.set_online(false);
        let task = supervise_feed(
            Arc::new(backend.clone()),
            FeedSpec::new(Table::Messages, EventFilter::Insert),
            "messages".into(),
            policy(2),
            RetryCounter::new(),
            |_event| async { ControlFlow::Continue(()) },
        )
        .await;

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(5)).await;
            settle().await;
        }
        assert!(!task.is_active(), "supervisor must stop after bounded retries");

        backend.set_online(true);
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(backend.feed_subscribers(Table::Messages), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_rejoins_and_reports_channel() {
        let backend = MemoryBackend::new();
        let joins = Arc::new(AtomicUsize::new(0));
        let join_counter = joins.clone();
        let _task = supervise_presence(
            Arc::new(backend.clone()),
            "chat:a:b".into(),
            "a".into(),
            policy(3),
            RetryCounter::new(),
            move |_channel| {
                let join_counter = join_counter.clone();
                async move {
                    join_counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            |_event| async { ControlFlow::Continue(()) },
        )
        .await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(backend.channel_members("chat:a:b"), 1);

        backend.fail_channel("chat:a:b", "timeout");
        settle().await;
        assert_eq!(backend.channel_members("chat:a:b"), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(joins.load(Ordering::SeqCst), 2);
        assert_eq!(backend.channel_members("chat:a:b"), 1);
    }
}
