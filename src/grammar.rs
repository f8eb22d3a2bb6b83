//! Command argument grammar: registration-time validation and dispatch-time
//! binding.
//!
//! `trovochat` has no command grammar of its own (it only maps raw IRC
//! commands to typed events), so the "validate a small token DSL against a
//! fixed regex up front" shape here follows `oxidized`'s use of `regex`: a
//! handful of small, named patterns checked once at definition time rather
//! than a hand-rolled parser.

use std::collections::{HashMap, VecDeque};

use regex::Regex;

/// What an argument slot resolves to once its text is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Plain text, no further lookup.
    Plain,
    /// Resolve to a `User` by nickname lookup in state (`~name`).
    Nick,
    /// Resolve to a `StoredUser`, either via nick-then-auth or a leading
    /// `*username` literal (`*name`).
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub optional: bool,
    pub variadic: bool,
    /// True only for the single leading `#channel` slot.
    pub channel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    InvalidToken(String),
    DuplicateName(String),
    ChannelArgNotFirst,
    MultipleChannelArgs,
    RequiredAfterOptional,
    ArgAfterVariadic,
    MultipleVariadicArgs,
}

impl std::fmt::Display for GrammarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken(tok) => write!(f, "invalid argument token: {:?}", tok),
            Self::DuplicateName(name) => write!(f, "duplicate argument name: {:?}", name),
            Self::ChannelArgNotFirst => {
                write!(f, "a #channel argument must be the first argument")
            }
            Self::MultipleChannelArgs => write!(f, "at most one #channel argument is allowed"),
            Self::RequiredAfterOptional => write!(
                f,
                "Required arguments must come before optional arguments and the variadic argument."
            ),
            Self::ArgAfterVariadic => write!(f, "no arguments may follow the variadic argument"),
            Self::MultipleVariadicArgs => write!(f, "at most one variadic argument is allowed"),
        }
    }
}

impl std::error::Error for GrammarError {}

struct TokenRegexes {
    channel: Regex,
    optional: Regex,
    plain: Regex,
}

fn token_regexes() -> &'static TokenRegexes {
    use std::sync::OnceLock;
    static RE: OnceLock<TokenRegexes> = OnceLock::new();
    RE.get_or_init(|| TokenRegexes {
        channel: Regex::new(r"(?i)^#([a-z0-9]+)$").unwrap(),
        optional: Regex::new(r"(?i)^\[([~*]?)([a-z0-9]+)\]$").unwrap(),
        plain: Regex::new(r"(?i)^([~*]?)([a-z0-9]+)(\.\.\.)?$").unwrap(),
    })
}

fn kind_for_sigil(sigil: &str) -> ArgKind {
    match sigil {
        "~" => ArgKind::Nick,
        "*" => ArgKind::User,
        _ => ArgKind::Plain,
    }
}

fn parse_token(token: &str) -> Result<ArgSpec, GrammarError> {
    let re = token_regexes();

    if let Some(caps) = re.channel.captures(token) {
        return Ok(ArgSpec {
            name: caps[1].to_ascii_lowercase(),
            kind: ArgKind::Plain,
            optional: false,
            variadic: false,
            channel: true,
        });
    }

    if let Some(caps) = re.optional.captures(token) {
        return Ok(ArgSpec {
            name: caps[2].to_ascii_lowercase(),
            kind: kind_for_sigil(&caps[1]),
            optional: true,
            variadic: false,
            channel: false,
        });
    }

    if let Some(caps) = re.plain.captures(token) {
        return Ok(ArgSpec {
            name: caps[2].to_ascii_lowercase(),
            kind: kind_for_sigil(&caps[1]),
            optional: false,
            variadic: caps.get(3).is_some(),
            channel: false,
        });
    }

    Err(GrammarError::InvalidToken(token.to_string()))
}

/// Parse and validate a command's argument specification at registration
/// time: unique names, at most one leading channel arg, required args
/// before optional before the variadic tail.
pub fn parse_args(tokens: &[&str]) -> Result<Vec<ArgSpec>, GrammarError> {
    let mut specs = Vec::with_capacity(tokens.len());
    for tok in tokens {
        specs.push(parse_token(tok)?);
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.name.clone()) {
            return Err(GrammarError::DuplicateName(spec.name.clone()));
        }
    }

    let channel_count = specs.iter().filter(|s| s.channel).count();
    if channel_count > 1 {
        return Err(GrammarError::MultipleChannelArgs);
    }
    if channel_count == 1 && !specs[0].channel {
        return Err(GrammarError::ChannelArgNotFirst);
    }

    let variadic_count = specs.iter().filter(|s| s.variadic).count();
    if variadic_count > 1 {
        return Err(GrammarError::MultipleVariadicArgs);
    }

    // Ordering: [channel?] required* optional* variadic?
    let mut seen_optional = false;
    let mut seen_variadic = false;
    for spec in specs.iter().skip(channel_count) {
        if seen_variadic {
            return Err(GrammarError::ArgAfterVariadic);
        }
        if spec.variadic {
            seen_variadic = true;
            continue;
        }
        if spec.optional {
            seen_optional = true;
        } else if seen_optional {
            return Err(GrammarError::RequiredAfterOptional);
        }
    }

    Ok(specs)
}

/// Whether the invoking message arrived on a channel or privately; controls
/// how a `#channel` argument is consumed.
#[derive(Debug, Clone, Copy)]
pub enum MessageScope<'a> {
    Public { channel: &'a str },
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    NotEnoughArguments { at_least: usize },
    TooManyArguments { at_most: usize },
    NoArgumentsExpected,
    ArgumentNotChannel { given: String },
}

/// The literal text bound to each argument slot. Further resolution of
/// `Nick`/`User` kind slots against `State`/`Store` happens in the command
/// dispatcher, which has both this map and the originating `ArgSpec`s.
#[derive(Debug, Clone, Default)]
pub struct BoundArgs {
    pub values: HashMap<String, String>,
}

fn min_max(specs: &[ArgSpec], scope: MessageScope<'_>) -> (usize, Option<usize>) {
    let has_channel = specs.first().is_some_and(|s| s.channel);
    let required = specs.iter().filter(|s| !s.optional && !s.variadic && !s.channel).count();
    let optional = specs.iter().filter(|s| s.optional).count();
    let has_variadic = specs.iter().any(|s| s.variadic);

    let channel_floor = match scope {
        MessageScope::Private if has_channel => 1,
        _ => 0,
    };
    let at_least = required + channel_floor;
    let at_most = if has_variadic {
        None
    } else {
        Some((has_channel as usize) + required + optional)
    };
    (at_least, at_most)
}

/// Bind a caller's whitespace-split tail against the command's argument
/// specs.
pub fn bind(
    specs: &[ArgSpec],
    tail: &str,
    scope: MessageScope<'_>,
    is_valid_channel: &dyn Fn(&str) -> bool,
) -> Result<BoundArgs, BindError> {
    let (at_least, at_most) = min_max(specs, scope);
    let mut tokens: VecDeque<&str> = tail.split_whitespace().collect();
    let mut values = HashMap::new();

    let channel_spec = specs.first().filter(|s| s.channel);
    if let Some(cspec) = channel_spec {
        match scope {
            MessageScope::Public { channel } => match tokens.front() {
                Some(first) if is_valid_channel(first) => {
                    values.insert(cspec.name.clone(), (*first).to_string());
                    tokens.pop_front();
                }
                _ => {
                    values.insert(cspec.name.clone(), channel.to_string());
                }
            },
            MessageScope::Private => match tokens.pop_front() {
                None => return Err(BindError::NotEnoughArguments { at_least }),
                Some(first) if is_valid_channel(first) => {
                    values.insert(cspec.name.clone(), first.to_string());
                }
                Some(first) => {
                    return Err(BindError::ArgumentNotChannel {
                        given: first.to_string(),
                    })
                }
            },
        }
    }

    let positional = specs.iter().filter(|s| !s.channel && !s.variadic);
    for spec in positional {
        if spec.optional {
            if let Some(tok) = tokens.pop_front() {
                values.insert(spec.name.clone(), tok.to_string());
            }
        } else {
            match tokens.pop_front() {
                Some(tok) => {
                    values.insert(spec.name.clone(), tok.to_string());
                }
                None => return Err(BindError::NotEnoughArguments { at_least }),
            }
        }
    }

    if let Some(vspec) = specs.iter().find(|s| s.variadic) {
        let joined = tokens.make_contiguous().join(" ");
        tokens.clear();
        values.insert(vspec.name.clone(), joined);
    } else if !tokens.is_empty() {
        return Err(match at_most {
            Some(0) => BindError::NoArgumentsExpected,
            Some(n) => BindError::TooManyArguments { at_most: n },
            None => unreachable!("no variadic arg implies at_most is Some"),
        });
    }

    Ok(BoundArgs { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(specs: &[ArgSpec]) -> Vec<&str> {
        specs.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn accepts_the_documented_example() {
        let specs = parse_args(&["#chan", "arg", "[opt]", "~users..."]).unwrap();
        assert_eq!(names(&specs), ["chan", "arg", "opt", "users"]);
        assert!(specs[0].channel);
        assert!(!specs[1].optional && !specs[1].variadic);
        assert!(specs[2].optional);
        assert!(specs[3].variadic && specs[3].kind == ArgKind::Nick);
    }

    #[test]
    fn rejects_required_after_optional() {
        let err = parse_args(&["[opt]", "req"]).unwrap_err();
        assert_eq!(err, GrammarError::RequiredAfterOptional);
        assert!(err.to_string().starts_with("Required arguments must come before"));
    }

    #[test]
    fn rejects_duplicate_names() {
        assert_eq!(
            parse_args(&["a", "a"]).unwrap_err(),
            GrammarError::DuplicateName("a".into())
        );
    }

    #[test]
    fn rejects_second_channel_arg() {
        assert_eq!(
            parse_args(&["#a", "#b"]).unwrap_err(),
            GrammarError::MultipleChannelArgs
        );
    }

    #[test]
    fn rejects_channel_arg_not_first() {
        assert_eq!(
            parse_args(&["a", "#b"]).unwrap_err(),
            GrammarError::ChannelArgNotFirst
        );
    }

    #[test]
    fn rejects_arg_after_variadic() {
        assert_eq!(
            parse_args(&["a...", "b"]).unwrap_err(),
            GrammarError::ArgAfterVariadic
        );
    }

    #[test]
    fn rejects_two_variadics() {
        assert_eq!(
            parse_args(&["a...", "b..."]).unwrap_err(),
            GrammarError::ArgAfterVariadic
        );
    }

    #[test]
    fn rejects_malformed_token() {
        assert!(matches!(
            parse_args(&["bad name"]).unwrap_err(),
            GrammarError::InvalidToken(_)
        ));
    }

    fn always_valid(_: &str) -> bool {
        true
    }
    fn never_valid(_: &str) -> bool {
        false
    }

    #[test]
    fn binds_public_command_without_channel_arg() {
        let specs = parse_args(&["arg"]).unwrap();
        let bound = bind(&specs, "hello", MessageScope::Public { channel: "#chan" }, &always_valid).unwrap();
        assert_eq!(bound.values["arg"], "hello");
    }

    #[test]
    fn channel_arg_resolves_from_private_message() {
        let specs = parse_args(&["#chan"]).unwrap();
        let bound = bind(&specs, "#other", MessageScope::Private, &always_valid).unwrap();
        assert_eq!(bound.values["chan"], "#other");
    }

    #[test]
    fn channel_arg_defaults_to_message_channel_when_public_and_no_token() {
        let specs = parse_args(&["#chan"]).unwrap();
        let bound = bind(&specs, "", MessageScope::Public { channel: "#chan" }, &never_valid).unwrap();
        assert_eq!(bound.values["chan"], "#chan");
    }

    #[test]
    fn private_without_channel_token_is_not_enough_arguments() {
        let specs = parse_args(&["#chan"]).unwrap();
        let err = bind(&specs, "", MessageScope::Private, &always_valid).unwrap_err();
        assert_eq!(err, BindError::NotEnoughArguments { at_least: 1 });
    }

    #[test]
    fn private_with_invalid_channel_token_errors() {
        let specs = parse_args(&["#chan"]).unwrap();
        let err = bind(&specs, "notachannel", MessageScope::Private, &never_valid).unwrap_err();
        assert_eq!(
            err,
            BindError::ArgumentNotChannel {
                given: "notachannel".into()
            }
        );
    }

    #[test]
    fn argument_count_laws() {
        // R=1 required, O=1 optional, V=0
        let specs = parse_args(&["req", "[opt]"]).unwrap();
        let scope = MessageScope::Public { channel: "#c" };

        assert_eq!(
            bind(&specs, "", scope, &always_valid).unwrap_err(),
            BindError::NotEnoughArguments { at_least: 1 }
        );
        assert!(bind(&specs, "a", scope, &always_valid).is_ok());
        assert!(bind(&specs, "a b", scope, &always_valid).is_ok());
        assert_eq!(
            bind(&specs, "a b c", scope, &always_valid).unwrap_err(),
            BindError::TooManyArguments { at_most: 2 }
        );
    }

    #[test]
    fn variadic_accepts_any_count_at_or_above_required() {
        let specs = parse_args(&["req", "rest..."]).unwrap();
        let scope = MessageScope::Public { channel: "#c" };
        assert!(bind(&specs, "a", scope, &always_valid).is_ok());
        assert!(bind(&specs, "a b c d e", scope, &always_valid).is_ok());
        assert_eq!(
            bind(&specs, "", scope, &always_valid).unwrap_err(),
            BindError::NotEnoughArguments { at_least: 1 }
        );
    }

    #[test]
    fn no_arguments_expected_when_command_takes_none() {
        let specs: Vec<ArgSpec> = vec![];
        let scope = MessageScope::Public { channel: "#c" };
        assert_eq!(
            bind(&specs, "unexpected", scope, &always_valid).unwrap_err(),
            BindError::NoArgumentsExpected
        );
    }

    #[test]
    fn star_kind_round_trips_kind_metadata() {
        let specs = parse_args(&["*user"]).unwrap();
        assert_eq!(specs[0].kind, ArgKind::User);
        let specs = parse_args(&["[*user]"]).unwrap();
        assert_eq!(specs[0].kind, ArgKind::User);
        assert!(specs[0].optional);
    }
}
