#![deny(
    deprecated_in_future,
    future_incompatible,
    rust_2018_compatibility,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
/*!

This crate is the dispatch core of a modular IRC bot: a handler trie, a
command-argument grammar, two dispatchers built on it (raw events and
chat commands), and a gRPC bridge that lets out-of-process extensions
register into the same tries as in-process handlers.

It owns no network connection and no persistence layer; those are
supplied by the embedding bot through the [`provider`] traits
([`provider::State`], [`provider::Store`], [`provider::Writer`],
[`provider::NetworkInfo`]).

---

For id allocation shared across every registry:
* [ids]
---
For the `(network, channel, event)` prefix trie:
* [trie]
---
For command argument grammar parsing and binding:
* [grammar]
---
For the wait-group, panic-recovery guard, and channel filter both
dispatchers share:
* [core]
---
For raw event subscription and dispatch:
* [event]
---
For command registration and dispatch:
* [command]
---
For the out-of-process extension bridge:
* [remote]

[ids]: ids/index.html
[trie]: trie/index.html
[grammar]: grammar/index.html
[core]: core/index.html
[event]: event/index.html
[command]: command/index.html
[remote]: remote/index.html
*/

pub mod command;
pub mod core;
pub mod event;
pub mod grammar;
pub mod ids;
pub mod provider;
pub mod remote;
pub mod trie;

#[doc(inline)]
pub use command::{CommandDispatcher, CommandKind, CommandScope, CommandSpec};
#[doc(inline)]
pub use core::DispatchCore;
#[doc(inline)]
pub use event::EventDispatcher;
#[doc(inline)]
pub use ids::IdAllocator;
#[doc(inline)]
pub use provider::{CmdEvent, IrcEvent, Provider, State, Store, Writer};
