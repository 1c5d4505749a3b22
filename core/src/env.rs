//! Environment overrides for child processes
//!
//! An override is either `KEY=VALUE` (set) or a bare `KEY` (unset). They are
//! applied in order on top of the inherited environment, so a later entry
//! for the same key wins.

use std::env;
use std::ffi::{OsStr, OsString};

/// One parsed override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride<'a> {
    /// `KEY=VALUE`
    Set(&'a str, &'a str),
    /// bare `KEY`
    Unset(&'a str),
}

impl<'a> EnvOverride<'a> {
    /// Parse `KEY=VALUE` or `KEY`; the key is everything before the first `=`
    pub fn parse(entry: &'a str) -> Self {
        match entry.split_once('=') {
            Some((key, value)) => EnvOverride::Set(key, value),
            None => EnvOverride::Unset(entry),
        }
    }

    /// The variable this override touches
    pub fn key(&self) -> &'a str {
        match self {
            EnvOverride::Set(key, _) | EnvOverride::Unset(key) => key,
        }
    }
}

/// Apply `overrides` to `base`, keeping the order of surviving variables.
pub fn apply_overrides<I>(base: I, overrides: &[String]) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut vars: Vec<(OsString, OsString)> = base.into_iter().collect();
    for entry in overrides {
        match EnvOverride::parse(entry) {
            EnvOverride::Set(key, value) => {
                match vars.iter_mut().find(|(k, _)| k.as_os_str() == OsStr::new(key)) {
                    Some((_, v)) => *v = OsString::from(value),
                    None => vars.push((OsString::from(key), OsString::from(value))),
                }
            }
            EnvOverride::Unset(key) => vars.retain(|(k, _)| k.as_os_str() != OsStr::new(key)),
        }
    }
    vars
}

/// The environment a child with these overrides will see
pub fn child_environment(overrides: &[String]) -> Vec<(OsString, OsString)> {
    apply_overrides(env::vars_os(), overrides)
}

/// Look up `key` in an environment list
pub fn lookup<'v>(vars: &'v [(OsString, OsString)], key: &str) -> Option<&'v OsStr> {
    vars.iter()
        .find(|(k, _)| k.as_os_str() == OsStr::new(key))
        .map(|(_, v)| v.as_os_str())
}
