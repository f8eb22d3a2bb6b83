//! Shared facilities used by both dispatchers: a handler wait-group, a
//! panic-recovery guard around scheduled handler tasks, a channel-interest
//! filter, and the is-this-a-channel classifier.
//!
//! The "schedule work, recover if it panics, track completion for clean
//! shutdown" shape generalizes the cooperative-shutdown idea in
//! `trovochat`'s `runner::runner` (which `select!`s an abort signal against
//! the socket read/write loop) from "stop reading the socket" to "wait for
//! every in-flight handler task".

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::provider::IrcEvent;

struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

/// Tracks the number of in-flight handler tasks. `wait()` resolves once
/// the count returns to zero; this is the clean-shutdown hook.
#[derive(Clone)]
pub struct WaitGroup(Arc<WaitGroupInner>);

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self(Arc::new(WaitGroupInner {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }))
    }

    fn start(&self) {
        self.0.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.0.count.load(Ordering::SeqCst)
    }

    /// Blocks until every handler started before this call (and any
    /// started concurrently) has finished.
    pub async fn wait(&self) {
        loop {
            if self.0.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            // `notified()` registers this waiter immediately, before the
            // recheck below, so a `finish()` racing between the two checks
            // is never missed.
            let notified = self.0.notify.notified();
            if self.0.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Lowercase set of channel names; when non-empty, channel-scoped dispatch
/// is suppressed for channels not in the set. Add/remove/replace are
/// idempotent.
#[derive(Clone, Default)]
pub struct ChannelFilter(Arc<RwLock<HashSet<String>>>);

impl ChannelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: &str) {
        self.0.write().insert(channel.to_ascii_lowercase());
    }

    pub fn remove(&self, channel: &str) {
        self.0.write().remove(&channel.to_ascii_lowercase());
    }

    pub fn replace(&self, channels: impl IntoIterator<Item = String>) {
        let mut set = self.0.write();
        set.clear();
        set.extend(channels.into_iter().map(|c| c.to_ascii_lowercase()));
    }

    /// True when the filter is empty (no restriction) or `channel` is a
    /// member.
    pub fn allows(&self, channel: &str) -> bool {
        let set = self.0.read();
        set.is_empty() || set.contains(&channel.to_ascii_lowercase())
    }
}

/// `isTargetChannel`: does the event's first argument name a channel,
/// per the event's own `NetworkInfo`.
pub fn is_target_channel(event: &IrcEvent) -> bool {
    event.args.first().is_some_and(|t| event.network_info.is_channel(t))
}

/// Facilities shared by the event and command dispatchers.
#[derive(Clone, Default)]
pub struct DispatchCore {
    wait_group: WaitGroup,
    filter: ChannelFilter,
}

impl DispatchCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&self) -> &ChannelFilter {
        &self.filter
    }

    pub async fn wait_for_handlers(&self) {
        self.wait_group.wait().await
    }

    pub fn outstanding_handlers(&self) -> usize {
        self.wait_group.outstanding()
    }

    /// Schedule `fut` as an independent task. `handler_file` is logged if
    /// the handler panics; it should name the source file the handler is
    /// defined in.
    pub fn spawn_handler<F>(&self, handler_file: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.wait_group.start();
        let wg = self.wait_group.clone();
        tokio::spawn(async move {
            // tokio already isolates a panicking task from the rest of the
            // runtime; spawning again here just gives us a `JoinError` to
            // inspect so the panic can be logged with its source location
            // instead of silently vanishing.
            let result = tokio::spawn(fut).await;
            if let Err(join_err) = result {
                if join_err.is_panic() {
                    log::warn!("handler panic recovered (handler defined in {})", handler_file);
                } else {
                    log::warn!("handler task cancelled (handler defined in {})", handler_file);
                }
            }
            wg.finish();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PrefixNetworkInfo;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn event(args: Vec<&str>) -> IrcEvent {
        IrcEvent {
            name: "PRIVMSG".into(),
            sender: "nick!u@h".into(),
            args: args.into_iter().map(String::from).collect(),
            time_unix_seconds: 0,
            network_id: "net".into(),
            network_info: Arc::new(PrefixNetworkInfo::default()),
        }
    }

    #[test]
    fn channel_filter_empty_allows_everything() {
        let f = ChannelFilter::new();
        assert!(f.allows("#chan"));
    }

    #[test]
    fn channel_filter_restricts_to_members() {
        let f = ChannelFilter::new();
        f.add("#Chan");
        assert!(f.allows("#chan"));
        assert!(!f.allows("#other"));
        f.remove("#chan");
        assert!(f.allows("#chan"));
    }

    #[test]
    fn channel_filter_replace_is_idempotent() {
        let f = ChannelFilter::new();
        f.replace(["#a".to_string(), "#b".to_string()]);
        f.replace(["#a".to_string(), "#b".to_string()]);
        assert!(f.allows("#a"));
        assert!(!f.allows("#c"));
    }

    #[test]
    fn target_classifier_checks_first_arg() {
        assert!(is_target_channel(&event(vec!["#chan", "text"])));
        assert!(!is_target_channel(&event(vec!["nick", "text"])));
        assert!(!is_target_channel(&event(vec![])));
    }

    #[tokio::test]
    async fn wait_for_handlers_blocks_until_drain() {
        let core = DispatchCore::new();
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            core.spawn_handler("test.rs", async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        core.wait_for_handlers().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(core.outstanding_handlers(), 0);
    }

    #[tokio::test]
    async fn panic_in_one_handler_does_not_block_others() {
        let core = DispatchCore::new();
        let ran = Arc::new(StdAtomicUsize::new(0));

        core.spawn_handler("panicking.rs", async {
            panic!("boom");
        });
        let ran2 = ran.clone();
        core.spawn_handler("ok.rs", async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        core.wait_for_handlers().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_handlers_is_safe_to_call_with_nothing_outstanding() {
        let core = DispatchCore::new();
        core.wait_for_handlers().await;
    }
}
