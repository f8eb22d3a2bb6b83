//! Command registration and dispatch: prefix stripping, `ext.name`
//! disambiguation, access checks, argument binding, scheduled invocation.
//!
//! `trovochat` has no command-grammar concept of its own, so this pipeline
//! is built straight on the handler trie and dispatch core, with
//! `Display`-rendered notices in `twitch::Error`'s hand-written style.

pub mod errors;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use errors::{BindError, RegisterError};

use crate::core::{is_target_channel, DispatchCore};
use crate::grammar::{self, ArgKind, ArgSpec, MessageScope};
use crate::ids::IdAllocator;
use crate::provider::{CmdEvent, IrcEvent, Provider, State, StoredUser, Store, Writer};
use crate::trie::Trie;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Privmsg,
    Notice,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    Private,
    Public,
    Any,
}

/// The generic command-handler entry point.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn cmd(&self, name: &str, writer: Arc<dyn Writer>, event: CmdEvent);

    fn source_file(&self) -> &'static str {
        "<unknown>"
    }
}

/// A registration-side stand-in for reflective "method named after the
/// command" dispatch: an extension can register one of these under the
/// command's name instead of relying on the blanket [`Handler::cmd`] entry
/// point.
#[async_trait]
pub trait NamedMethod: Send + Sync {
    async fn call(&self, writer: Arc<dyn Writer>, event: CmdEvent);
}

/// An immutable, registered command. Construct via [`CommandSpec::builder`].
pub struct CommandSpec {
    pub name: String,
    pub extension: String,
    pub description: String,
    pub kind: CommandKind,
    pub scope: CommandScope,
    pub args: Vec<ArgSpec>,
    pub require_auth: bool,
    pub req_level: u8,
    pub req_flags: String,
    handler: Arc<dyn Handler>,
    methods: HashMap<String, Arc<dyn NamedMethod>>,
}

impl CommandSpec {
    pub fn builder(
        name: impl Into<String>,
        extension: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> CommandSpecBuilder {
        CommandSpecBuilder {
            name: name.into(),
            extension: extension.into(),
            description: description.into(),
            kind: CommandKind::Any,
            scope: CommandScope::Any,
            arg_tokens: Vec::new(),
            require_auth: false,
            req_level: 0,
            req_flags: String::new(),
            handler,
            methods: HashMap::new(),
        }
    }

    fn needs_store(&self) -> bool {
        self.require_auth || self.args.iter().any(|a| a.kind == ArgKind::User)
    }

    /// Channel and nick args always need state to resolve. User-kind args
    /// only need it on the nick-then-auth path (a literal `*username`
    /// bypasses state), so they don't force the requirement here — see
    /// [`CommandSpec::wants_state`].
    fn hard_state_required(&self) -> bool {
        self.args.iter().any(|a| a.channel || a.kind == ArgKind::Nick)
    }

    fn wants_state(&self) -> bool {
        self.hard_state_required() || self.args.iter().any(|a| a.kind == ArgKind::User)
    }
}

pub struct CommandSpecBuilder {
    name: String,
    extension: String,
    description: String,
    kind: CommandKind,
    scope: CommandScope,
    arg_tokens: Vec<String>,
    require_auth: bool,
    req_level: u8,
    req_flags: String,
    handler: Arc<dyn Handler>,
    methods: HashMap<String, Arc<dyn NamedMethod>>,
}

impl CommandSpecBuilder {
    pub fn kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn scope(mut self, scope: CommandScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn args(mut self, tokens: &[&str]) -> Self {
        self.arg_tokens = tokens.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn require_auth(mut self, req_level: u8, req_flags: impl Into<String>) -> Self {
        self.require_auth = true;
        self.req_level = req_level;
        self.req_flags = req_flags.into();
        self
    }

    pub fn method(mut self, name: impl Into<String>, method: Arc<dyn NamedMethod>) -> Self {
        self.methods.insert(name.into().to_ascii_lowercase(), method);
        self
    }

    pub fn build(self) -> Result<CommandSpec, RegisterError> {
        if self.name.trim().is_empty() {
            return Err(RegisterError::EmptyName);
        }
        if self.extension.trim().is_empty() {
            return Err(RegisterError::EmptyExtension);
        }
        if self.description.trim().is_empty() {
            return Err(RegisterError::EmptyDescription);
        }
        let tokens: Vec<&str> = self.arg_tokens.iter().map(String::as_str).collect();
        let args = grammar::parse_args(&tokens)?;
        Ok(CommandSpec {
            name: self.name.to_ascii_lowercase(),
            extension: self.extension.to_ascii_lowercase(),
            description: self.description,
            kind: self.kind,
            scope: self.scope,
            args,
            require_auth: self.require_auth,
            req_level: self.req_level,
            req_flags: self.req_flags,
            handler: self.handler,
            methods: self.methods,
        })
    }
}

fn render_spec(args: &[ArgSpec]) -> String {
    args.iter()
        .map(|a| {
            let sigil = match a.kind {
                ArgKind::Nick => "~",
                ArgKind::User => "*",
                ArgKind::Plain => "",
            };
            if a.channel {
                format!("#{}", a.name)
            } else if a.optional {
                format!("[{}{}]", sigil, a.name)
            } else if a.variadic {
                format!("{}{}...", sigil, a.name)
            } else {
                format!("{}{}", sigil, a.name)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn translate_bind_error(e: grammar::BindError, spec: &str) -> BindError {
    match e {
        grammar::BindError::NotEnoughArguments { at_least } => BindError::NotEnoughArguments {
            at_least,
            spec: spec.to_string(),
        },
        grammar::BindError::TooManyArguments { at_most } => BindError::TooManyArguments {
            at_most,
            spec: spec.to_string(),
        },
        grammar::BindError::NoArgumentsExpected => BindError::NoArgumentsExpected { spec: spec.to_string() },
        grammar::BindError::ArgumentNotChannel { given } => BindError::ArgumentNotChannel { given },
    }
}

/// Resolve a single `*`-kind slot to a `StoredUser`: a leading `*username`
/// bypasses state and looks the name up in the store directly; otherwise
/// the text is a nickname that must resolve in state, then be
/// authenticated in the store.
async fn resolve_stored_user(
    text: &str,
    state: Option<&Arc<dyn State>>,
    store: &Arc<dyn Store>,
    network: &str,
) -> Result<StoredUser, BindError> {
    if let Some(username) = text.strip_prefix('*') {
        if username.is_empty() {
            return Err(BindError::MissingUsernameAfterStar);
        }
        return store
            .find_user(username)
            .await
            .map_err(|_| BindError::UserNotRegistered { name: username.to_string() });
    }

    let state = state.ok_or(BindError::StateDisabled)?;
    let user = state
        .user(text)
        .await
        .ok_or_else(|| BindError::UserNotFound { name: text.to_string() })?;
    store
        .authed_user(network, &user.host)
        .await
        .ok_or_else(|| BindError::UserNotAuthenticated { name: text.to_string() })
}

/// Caller-supplied per-(network, channel) command prefix.
pub type PrefixFetcher = Arc<dyn Fn(&str, &str) -> char + Send + Sync>;

pub struct CommandDispatcher {
    trie: Trie<CommandSpec>,
    core: DispatchCore,
    prefix_fetcher: PrefixFetcher,
}

impl CommandDispatcher {
    pub fn new(ids: IdAllocator, core: DispatchCore, prefix_fetcher: PrefixFetcher) -> Self {
        Self {
            trie: Trie::new(false, ids),
            core,
            prefix_fetcher,
        }
    }

    pub async fn wait_for_handlers(&self) {
        self.core.wait_for_handlers().await
    }

    /// Insert `spec` at `(network, channel, spec.name)`. Refuses a second
    /// registration from the same extension at the exact same triple;
    /// different extensions may share a triple, resolved at dispatch time
    /// via `ext.name`.
    pub fn register(&self, network: &str, channel: &str, spec: CommandSpec) -> Result<u64, RegisterError> {
        let existing = self.trie.exact(network, channel, &spec.name);
        if existing.iter().any(|c| c.extension == spec.extension) {
            return Err(RegisterError::DuplicateCommand {
                network: network.to_string(),
                channel: channel.to_string(),
                name: spec.name.clone(),
                extension: spec.extension.clone(),
            });
        }
        let (network_l, channel_l, name_l, ext_l) = (
            network.to_string(),
            channel.to_string(),
            spec.name.clone(),
            spec.extension.clone(),
        );
        let id = self.trie.register(network, channel, &spec.name.clone(), spec);
        log::debug!(
            "registered command {:?} (ext {:?}) id {} on {}/{}",
            name_l,
            ext_l,
            id,
            network_l,
            channel_l
        );
        Ok(id)
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.trie.unregister(id)
    }

    /// Runs the full registration-lookup-auth-bind-schedule pipeline for one
    /// incoming event. Returns `Ok(())`
    /// for a no-op (not a command, unmatched, or successfully scheduled)
    /// and `Err` for a user-input error that was already sent to the
    /// caller as a NOTICE.
    pub async fn dispatch(
        &self,
        writer: Arc<dyn Writer>,
        event: IrcEvent,
        provider: Arc<dyn Provider>,
    ) -> Result<(), BindError> {
        if event.name != "PRIVMSG" && event.name != "NOTICE" {
            return Ok(());
        }

        let text = event.args.get(1).cloned().unwrap_or_default();
        let mut fields = text.split_whitespace();
        let Some(first_field) = fields.next() else {
            return Ok(());
        };
        let rest: String = fields.collect::<Vec<_>>().join(" ");

        let is_channel = is_target_channel(&event);
        let channel_name = if is_channel {
            event.args.first().cloned().unwrap_or_default()
        } else {
            String::new()
        };

        let (command_token, scope) = if is_channel {
            let prefix = (self.prefix_fetcher)(&event.network_id, &channel_name);
            let Some(stripped) = first_field.strip_prefix(prefix) else {
                return Ok(());
            };
            if stripped.is_empty() {
                return Ok(());
            }
            (stripped.to_string(), CommandScope::Public)
        } else {
            (first_field.to_string(), CommandScope::Private)
        };

        let (ext_filter, cmd_name) = match command_token.split_once('.') {
            Some((ext, name)) => (Some(ext.to_ascii_lowercase()), name.to_ascii_lowercase()),
            None => (None, command_token.to_ascii_lowercase()),
        };

        let candidates = self.trie.handlers(&event.network_id, &channel_name, &cmd_name);
        let matching: Vec<_> = match &ext_filter {
            Some(ext) => candidates.into_iter().filter(|c| &c.extension == ext).collect(),
            None => candidates,
        };

        if matching.is_empty() {
            return Ok(());
        }

        if matching.len() > 1 {
            let mut names: Vec<String> = matching.iter().map(|c| format!("{}.{}", c.extension, c.name)).collect();
            names.sort();
            let err = BindError::AmbiguousCommand {
                name: cmd_name,
                candidates: names,
            };
            writer.notice(event.sender_nick(), &err.to_string());
            return Err(err);
        }

        let spec = matching.into_iter().next().unwrap();

        let kind_ok = match spec.kind {
            CommandKind::Any => true,
            CommandKind::Privmsg => event.name == "PRIVMSG",
            CommandKind::Notice => event.name == "NOTICE",
        };
        if !kind_ok {
            return Ok(());
        }
        if spec.scope != CommandScope::Any && spec.scope != scope {
            return Ok(());
        }

        let store = if spec.needs_store() {
            match provider.store().await {
                Some(s) => Some(s),
                None => {
                    let err = BindError::StoreDisabled;
                    writer.notice(event.sender_nick(), &err.to_string());
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut stored_user = None;
        if spec.require_auth {
            let store = store.as_ref().expect("needs_store() is true when require_auth is set");
            let authed = store.authed_user(&event.network_id, event.sender_host()).await;
            let Some(user) = authed else {
                let err = BindError::NotAuthenticated;
                writer.notice(event.sender_nick(), &err.to_string());
                return Err(err);
            };
            if spec.req_level > 0 && !user.has_level(&event.network_id, &channel_name, spec.req_level) {
                let err = BindError::InsufficientLevel { level: spec.req_level };
                writer.notice(event.sender_nick(), &err.to_string());
                return Err(err);
            }
            if !spec.req_flags.is_empty() && !user.has_flags(&event.network_id, &channel_name, &spec.req_flags) {
                let err = BindError::InsufficientFlags {
                    flags: spec.req_flags.clone(),
                };
                writer.notice(event.sender_nick(), &err.to_string());
                return Err(err);
            }
            stored_user = Some(user);
        }

        let state = if spec.wants_state() {
            let fetched = provider.state(&event.network_id).await;
            if spec.hard_state_required() && fetched.is_none() {
                let err = BindError::StateDisabled;
                writer.notice(event.sender_nick(), &err.to_string());
                return Err(err);
            }
            fetched
        } else {
            None
        };

        let message_scope = if is_channel {
            MessageScope::Public { channel: &channel_name }
        } else {
            MessageScope::Private
        };
        let spec_render = render_spec(&spec.args);
        let is_valid_channel = |s: &str| event.network_info.is_channel(s);
        let bound = match grammar::bind(&spec.args, &rest, message_scope, &is_valid_channel) {
            Ok(b) => b,
            Err(e) => {
                let err = translate_bind_error(e, &spec_render);
                writer.notice(event.sender_nick(), &err.to_string());
                return Err(err);
            }
        };

        let mut cmd_event = CmdEvent {
            args: bound.values.clone(),
            stored_user: stored_user.clone(),
            ..CmdEvent::default()
        };

        if let Some(state) = &state {
            cmd_event.user = state.user(event.sender_host()).await;
            if is_channel {
                cmd_event.channel = state.channel(&channel_name).await;
                cmd_event.user_modes = state.user_modes(event.sender_host(), &channel_name).await;
            }
        }

        for arg in &spec.args {
            let Some(text) = bound.values.get(&arg.name) else {
                continue;
            };
            if arg.channel {
                if let Some(state) = &state {
                    cmd_event.target_channel = state.channel(text).await;
                }
                continue;
            }
            match arg.kind {
                ArgKind::Plain => {}
                ArgKind::Nick if arg.variadic => {
                    if let Some(state) = &state {
                        for tok in text.split_whitespace() {
                            match state.user(tok).await {
                                Some(u) => cmd_event.target_var_users.push(u),
                                None => {
                                    let err = BindError::UserNotFound { name: tok.to_string() };
                                    writer.notice(event.sender_nick(), &err.to_string());
                                    return Err(err);
                                }
                            }
                        }
                    }
                }
                ArgKind::Nick => {
                    if !text.is_empty() {
                        if let Some(state) = &state {
                            match state.user(text).await {
                                Some(u) => {
                                    cmd_event.target_users.insert(arg.name.clone(), u);
                                }
                                None => {
                                    let err = BindError::UserNotFound { name: text.to_string() };
                                    writer.notice(event.sender_nick(), &err.to_string());
                                    return Err(err);
                                }
                            }
                        }
                    }
                }
                ArgKind::User if arg.variadic => {
                    let store = store.as_ref().expect("needs_store() is true for any User-kind arg");
                    for tok in text.split_whitespace() {
                        match resolve_stored_user(tok, state.as_ref(), store, &event.network_id).await {
                            Ok(su) => cmd_event.target_var_stored_users.push(su),
                            Err(e) => {
                                writer.notice(event.sender_nick(), &e.to_string());
                                return Err(e);
                            }
                        }
                    }
                }
                ArgKind::User => {
                    if !text.is_empty() {
                        let store = store.as_ref().expect("needs_store() is true for any User-kind arg");
                        match resolve_stored_user(text, state.as_ref(), store, &event.network_id).await {
                            Ok(su) => {
                                cmd_event.target_stored_users.insert(arg.name.clone(), su);
                            }
                            Err(e) => {
                                writer.notice(event.sender_nick(), &e.to_string());
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }

        cmd_event.event = Some(event);

        let name = spec.name.clone();
        let handler = spec.handler.clone();
        let method = spec.methods.get(&spec.name).cloned();
        let source_file = handler.source_file();
        self.core.spawn_handler(source_file, async move {
            if let Some(method) = method {
                method.call(writer, cmd_event).await;
            } else {
                handler.cmd(&name, writer, cmd_event).await;
            }
        });

        Ok(())
    }
}
