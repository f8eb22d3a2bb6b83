//! Read-only collaborator contracts (`State`, `Store`, `Writer`,
//! `NetworkInfo`) and the plain snapshot types that travel through
//! `CmdEvent` and the remote wire envelopes.
//!
//! None of this is dispatch logic; it exists so the trie, the grammar
//! binder, and both dispatchers can be typed and tested against one stable
//! contract without a real bot attached. Object-safety via `async_trait`
//! follows the same pattern `sid3xyz-slircd-ng`'s `handlers/core/traits.rs`
//! uses for its handler trait.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

/// A live user as seen in `State` (channel/user membership).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl User {
    pub fn new(nick: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            user: user.into(),
            host: host.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A user's channel modes as a set of mode characters (e.g. `o`, `v`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserModes(pub HashSet<char>);

impl UserModes {
    pub fn has(&self, mode: char) -> bool {
        self.0.contains(&mode)
    }
}

/// One network/channel-scoped access grant: a level and a set of flag
/// characters. An empty channel string means "network-wide".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    pub level: u8,
    pub flags: HashSet<char>,
}

/// A persisted, authenticated identity from the `Store`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredUser {
    pub username: String,
    access: HashMap<(String, String), Access>,
}

impl StoredUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            access: HashMap::new(),
        }
    }

    /// Grant `access` for `(network, channel)`; an empty `channel` applies
    /// network-wide and is consulted by [`StoredUser::has_level`] /
    /// [`StoredUser::has_flags`] as a fallback when no exact-channel entry
    /// exists.
    pub fn grant(mut self, network: impl Into<String>, channel: impl Into<String>, access: Access) -> Self {
        self.access.insert((network.into(), channel.into()), access);
        self
    }

    fn entries_for<'a>(&'a self, network: &'a str, channel: &'a str) -> impl Iterator<Item = &'a Access> {
        let exact = self.access.get(&(network.to_string(), channel.to_string()));
        let network_wide = self.access.get(&(network.to_string(), String::new()));
        exact.into_iter().chain(network_wide.into_iter())
    }

    pub fn has_level(&self, network: &str, channel: &str, level: u8) -> bool {
        self.entries_for(network, channel).any(|a| a.level >= level)
    }

    pub fn has_flags(&self, network: &str, channel: &str, flags: &str) -> bool {
        self.entries_for(network, channel)
            .any(|a| flags.chars().all(|f| a.flags.contains(&f)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotFound(pub String);

impl std::fmt::Display for UserNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user not found: {}", self.0)
    }
}

impl std::error::Error for UserNotFound {}

/// The bot's live view of who is on which channel. Read-only for the
/// dispatcher.
#[async_trait]
pub trait State: Send + Sync {
    async fn user(&self, host: &str) -> Option<User>;
    async fn channel(&self, name: &str) -> Option<Channel>;
    async fn user_modes(&self, host: &str, channel: &str) -> Option<UserModes>;
}

/// The bot's persistent authentication/ACL database. Read-only for the
/// dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    async fn authed_user(&self, network: &str, host: &str) -> Option<StoredUser>;
    async fn find_user(&self, username: &str) -> Result<StoredUser, UserNotFound>;
}

/// A handler's only way to produce output. Assumed callable from any task
/// without external synchronization (`Send + Sync`).
pub trait Writer: Send + Sync {
    fn write(&self, bytes: &[u8]) -> std::io::Result<usize>;

    fn notice(&self, nick: &str, text: &str) {
        let _ = self.write(format!("NOTICE {} :{}\r\n", nick, text).as_bytes());
    }

    fn send(&self, parts: &[&str]) {
        let _ = self.write(format!("{}\r\n", parts.join(" ")).as_bytes());
    }

    fn sendf(&self, args: std::fmt::Arguments<'_>) {
        let _ = self.write(format!("{}\r\n", args).as_bytes());
    }
}

/// Consulted for channel-target classification; supplied per-event by the
/// active network connection.
pub trait NetworkInfo: Send + Sync {
    fn is_channel(&self, target: &str) -> bool;
}

/// Simple `NetworkInfo` that treats any target starting with one of a
/// configured set of prefixes (default `#` and `&`) as a channel.
pub struct PrefixNetworkInfo {
    prefixes: Vec<char>,
}

impl Default for PrefixNetworkInfo {
    fn default() -> Self {
        Self {
            prefixes: vec!['#', '&'],
        }
    }
}

impl PrefixNetworkInfo {
    pub fn new(prefixes: Vec<char>) -> Self {
        Self { prefixes }
    }
}

impl NetworkInfo for PrefixNetworkInfo {
    fn is_channel(&self, target: &str) -> bool {
        target.chars().next().is_some_and(|c| self.prefixes.contains(&c))
    }
}

/// The parsed IRC event the dispatcher consumes. `network_info` travels
/// with the event rather than through `Provider`.
#[derive(Clone)]
pub struct IrcEvent {
    pub name: String,
    pub sender: String,
    pub args: Vec<String>,
    pub time_unix_seconds: u64,
    pub network_id: String,
    pub network_info: Arc<dyn NetworkInfo>,
}

impl IrcEvent {
    /// The nick portion of `nick!user@host`; the whole string if there's
    /// no `!`.
    pub fn sender_nick(&self) -> &str {
        self.sender.split('!').next().unwrap_or(&self.sender)
    }

    pub fn sender_host(&self) -> &str {
        self.sender.split('@').nth(1).unwrap_or(&self.sender)
    }
}

/// Per-invocation data handed to a command handler. Owns cloned snapshots,
/// not references into `Provider` — there is no lifetime to enforce beyond
/// the handler's own call frame.
#[derive(Clone, Default)]
pub struct CmdEvent {
    pub event: Option<IrcEvent>,
    pub user: Option<User>,
    pub stored_user: Option<StoredUser>,
    pub user_modes: Option<UserModes>,
    pub channel: Option<Channel>,
    pub target_channel: Option<Channel>,
    pub target_users: HashMap<String, User>,
    pub target_stored_users: HashMap<String, StoredUser>,
    pub target_var_users: Vec<User>,
    pub target_var_stored_users: Vec<StoredUser>,
    pub args: HashMap<String, String>,
}

/// The dispatcher's only coupling to the bot's live state and persistence
/// layers.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn state(&self, network_id: &str) -> Option<Arc<dyn State>>;
    async fn store(&self) -> Option<Arc<dyn Store>>;
}

/// In-memory `State`/`Store` double used by the test suite to exercise
/// auth- and state-dependent binding paths without a real bot attached.
#[derive(Default)]
pub struct NoopState {
    users_by_host: RwLock<HashMap<String, User>>,
    channels: RwLock<HashMap<String, Channel>>,
    modes: RwLock<HashMap<(String, String), UserModes>>,
}

impl NoopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, host: impl Into<String>, user: User) -> Self {
        self.users_by_host.write().insert(host.into(), user);
        self
    }

    pub fn with_channel(self, channel: Channel) -> Self {
        self.channels.write().insert(channel.name.clone(), channel);
        self
    }

    pub fn with_modes(self, host: impl Into<String>, channel: impl Into<String>, modes: UserModes) -> Self {
        self.modes.write().insert((host.into(), channel.into()), modes);
        self
    }
}

#[async_trait]
impl State for NoopState {
    async fn user(&self, host: &str) -> Option<User> {
        self.users_by_host.read().get(host).cloned()
    }

    async fn channel(&self, name: &str) -> Option<Channel> {
        self.channels.read().get(name).cloned()
    }

    async fn user_modes(&self, host: &str, channel: &str) -> Option<UserModes> {
        self.modes.read().get(&(host.to_string(), channel.to_string())).cloned()
    }
}

#[derive(Default)]
pub struct NoopStore {
    authed: RwLock<HashMap<(String, String), StoredUser>>,
    registered: RwLock<HashMap<String, StoredUser>>,
}

impl NoopStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authed(self, network: impl Into<String>, host: impl Into<String>, user: StoredUser) -> Self {
        self.authed.write().insert((network.into(), host.into()), user.clone());
        self.registered.write().insert(user.username.clone(), user);
        self
    }

    pub fn with_registered(self, user: StoredUser) -> Self {
        self.registered.write().insert(user.username.clone(), user);
        self
    }
}

#[async_trait]
impl Store for NoopStore {
    async fn authed_user(&self, network: &str, host: &str) -> Option<StoredUser> {
        self.authed.read().get(&(network.to_string(), host.to_string())).cloned()
    }

    async fn find_user(&self, username: &str) -> Result<StoredUser, UserNotFound> {
        self.registered
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| UserNotFound(username.to_string()))
    }
}

/// `Provider` double: holds at most one `State` (shared across all
/// networks, for test simplicity) and at most one `Store`. Either may be
/// absent, to exercise the "state disabled" / "store disabled" error
/// paths.
#[derive(Default)]
pub struct NoopProvider {
    state: Option<Arc<dyn State>>,
    store: Option<Arc<dyn Store>>,
}

impl NoopProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: Arc<dyn State>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl Provider for NoopProvider {
    async fn state(&self, _network_id: &str) -> Option<Arc<dyn State>> {
        self.state.clone()
    }

    async fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }
}

/// A `Writer` that records everything written, for test assertions.
#[derive(Default)]
pub struct RecordingWriter {
    pub lines: RwLock<Vec<String>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.read().clone()
    }
}

impl Writer for RecordingWriter {
    fn write(&self, bytes: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(bytes).trim_end_matches("\r\n").to_string();
        self.lines.write().push(text);
        Ok(bytes.len())
    }
}
