//! Raw event subscription and dispatch: trie-backed registration, wildcard
//! fallthrough, fan-out to independently scheduled handlers.
//!
//! Generalizes `trovochat::Dispatcher::dispatch`'s match-then-fan-out shape
//! (one lookup keyed on the incoming message's command, then notify every
//! subscriber) from a single per-message-type map to the three-level trie
//! this crate needs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{is_target_channel, DispatchCore};
use crate::ids::IdAllocator;
use crate::provider::{IrcEvent, Writer};
use crate::trie::Trie;

/// A raw-event subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, writer: Arc<dyn Writer>, event: IrcEvent);

    /// Source file this handler is defined in; logged if it panics.
    fn source_file(&self) -> &'static str {
        "<unknown>"
    }
}

pub type BoxedEventHandler = Box<dyn EventHandler>;

/// Accepts event subscriptions and fans incoming events out to them.
pub struct EventDispatcher {
    trie: Trie<BoxedEventHandler>,
    core: DispatchCore,
}

impl EventDispatcher {
    pub fn new(ids: IdAllocator, core: DispatchCore) -> Self {
        Self {
            trie: Trie::new(false, ids),
            core,
        }
    }

    /// Subscribe `handler` to `(network, channel, event)`, wildcard
    /// (empty string) matching any value in that position.
    pub fn register(&self, network: &str, channel: &str, event: &str, handler: BoxedEventHandler) -> u64 {
        let id = self.trie.register(network, channel, event, handler);
        log::debug!("registered event handler {} for {}/{}/{}", id, network, channel, event);
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.trie.unregister(id);
        if removed {
            log::debug!("unregistered event handler {}", id);
        }
        removed
    }

    pub async fn wait_for_handlers(&self) {
        self.core.wait_for_handlers().await
    }

    /// Look up matching handlers and schedule each as an independent task.
    /// Returns once every handler has been scheduled (not run).
    pub fn dispatch(&self, writer: Arc<dyn Writer>, event: IrcEvent) {
        let channel_scoped = is_target_channel(&event);
        let channel = if channel_scoped {
            event.args.first().cloned().unwrap_or_default()
        } else {
            String::new()
        };

        if channel_scoped && !self.core.filter().allows(&channel) {
            log::trace!("event {} on filtered-out channel {}, skipping", event.name, channel);
            return;
        }

        let handlers = self.trie.handlers(&event.network_id, &channel, &event.name);
        log::trace!(
            "dispatching event {} on {}/{} to {} handler(s)",
            event.name,
            event.network_id,
            channel,
            handlers.len()
        );

        for handler in handlers {
            let writer = writer.clone();
            let event = event.clone();
            let source_file = handler.source_file();
            self.core.spawn_handler(source_file, async move {
                handler.handle(writer, event).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{PrefixNetworkInfo, RecordingWriter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(network: &str, target: &str, name: &str) -> IrcEvent {
        IrcEvent {
            name: name.to_string(),
            sender: "nick!u@h".into(),
            args: vec![target.to_string(), "text".into()],
            time_unix_seconds: 0,
            network_id: network.to_string(),
            network_info: Arc::new(PrefixNetworkInfo::default()),
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _writer: Arc<dyn Writer>, _event: IrcEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn source_file(&self) -> &'static str {
            "event/mod.rs tests"
        }
    }

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(IdAllocator::new(), DispatchCore::new())
    }

    #[tokio::test]
    async fn wildcard_registration_sees_every_event() {
        let d = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        d.register("", "", "", Box::new(Counting(count.clone())));

        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        d.dispatch(writer.clone(), event("net", "#chan", "JOIN"));
        d.dispatch(writer, event("other", "#other", "PART"));
        d.wait_for_handlers().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exact_registration_only_sees_matching_triple() {
        let d = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        d.register("net", "#chan", "join", Box::new(Counting(count.clone())));

        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        d.dispatch(writer.clone(), event("net", "#chan", "JOIN"));
        d.dispatch(writer, event("net", "#other", "JOIN"));
        d.wait_for_handlers().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_filter_suppresses_channel_scoped_dispatch() {
        let d = dispatcher();
        d.core.filter().add("#allowed");
        let count = Arc::new(AtomicUsize::new(0));
        d.register("", "", "", Box::new(Counting(count.clone())));

        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        d.dispatch(writer.clone(), event("net", "#blocked", "PRIVMSG"));
        d.dispatch(writer, event("net", "#allowed", "PRIVMSG"));
        d.wait_for_handlers().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_stops_future_dispatch() {
        let d = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let id = d.register("net", "", "join", Box::new(Counting(count.clone())));
        assert!(d.unregister(id));

        let writer: Arc<dyn Writer> = Arc::new(RecordingWriter::new());
        d.dispatch(writer, event("net", "#chan", "JOIN"));
        d.wait_for_handlers().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
