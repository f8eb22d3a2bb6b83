//! Tier 1 (`RegisterError`) and tier 2 (`BindError`) error types.
//!
//! Hand-written `Display`/`std::error::Error` impls, in the same spirit as
//! this codebase's `twitch::Error` rather than reaching for `thiserror`:
//! one `match` per variant, short declarative sentences.

use crate::grammar::GrammarError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    EmptyName,
    EmptyExtension,
    EmptyDescription,
    Grammar(GrammarError),
    /// The exact `(network, channel, name)` triple already has a handler
    /// registered by this extension.
    DuplicateCommand {
        network: String,
        channel: String,
        name: String,
        extension: String,
    },
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "command name must not be empty"),
            Self::EmptyExtension => write!(f, "command extension must not be empty"),
            Self::EmptyDescription => write!(f, "command description must not be empty"),
            Self::Grammar(e) => write!(f, "invalid argument grammar: {}", e),
            Self::DuplicateCommand {
                network,
                channel,
                name,
                extension,
            } => write!(
                f,
                "duplicate command {:?} for extension {:?} on {}/{}",
                name, extension, network, channel
            ),
        }
    }
}

impl std::error::Error for RegisterError {}

impl From<GrammarError> for RegisterError {
    fn from(e: GrammarError) -> Self {
        Self::Grammar(e)
    }
}

/// A dispatch-time, user-input error. `Display` renders the exact notice
/// text sent to the caller; extensions' own tests assert against that
/// wording, so it must not drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    NotEnoughArguments { at_least: usize, spec: String },
    TooManyArguments { at_most: usize, spec: String },
    NoArgumentsExpected { spec: String },
    ArgumentNotChannel { given: String },
    UserNotFound { name: String },
    UserNotRegistered { name: String },
    UserNotAuthenticated { name: String },
    StateDisabled,
    StoreDisabled,
    MissingUsernameAfterStar,
    NotAuthenticated,
    InsufficientLevel { level: u8 },
    InsufficientFlags { flags: String },
    AmbiguousCommand { name: String, candidates: Vec<String> },
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEnoughArguments { at_least, spec } => {
                write!(f, "Error: Expected at least {} arguments. ({})", at_least, spec)
            }
            Self::TooManyArguments { at_most, spec } => {
                write!(f, "Error: Expected at most {} arguments. ({})", at_most, spec)
            }
            Self::NoArgumentsExpected { spec } => {
                write!(f, "Error: Expected exactly 0 arguments. ({})", spec)
            }
            Self::ArgumentNotChannel { given } => {
                write!(f, "Error: Expected a valid channel. (given: {})", given)
            }
            Self::UserNotFound { name } => write!(f, "Error: User [{}] could not be found.", name),
            Self::UserNotRegistered { name } => write!(f, "Error: User [{}] is not registered.", name),
            Self::UserNotAuthenticated { name } => write!(f, "Error: User [{}] is not authenticated.", name),
            Self::StateDisabled => write!(
                f,
                "Error: Cannot use nick or user parameter commands when state is disabled."
            ),
            Self::StoreDisabled => write!(
                f,
                "Access Denied: Cannot use authenticated commands, nick or user parameters when store is disabled."
            ),
            Self::MissingUsernameAfterStar => {
                write!(f, "Error: Expected a username after '*'.")
            }
            Self::NotAuthenticated => write!(
                f,
                "Access Denied: You are not authenticated. Identify with the bot and try again."
            ),
            Self::InsufficientLevel { level } => {
                write!(f, "Access Denied: ({}) level required.", level)
            }
            Self::InsufficientFlags { flags } => {
                write!(f, "Access Denied: ({}) flag(s) required.", flags)
            }
            Self::AmbiguousCommand { name, candidates } => write!(
                f,
                "Error: Ambiguous command ({}) found matching: [{}], try \"help\".",
                name,
                candidates.join(",")
            ),
        }
    }
}

impl std::error::Error for BindError {}
