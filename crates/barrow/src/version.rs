//! Release version numbers.
//!
//! Implements the part of PEP 440 that migration versions use: an optional
//! `v` prefix, a dotted release, an optional pre-release (`a`, `b`, `rc` and
//! their spelled-out aliases), an optional post release and an optional dev
//! release. Epochs and local versions are rejected.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version: {0:?}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

impl PreRelease {
    fn as_str(self) -> &'static str {
        match self {
            PreRelease::Alpha => "a",
            PreRelease::Beta => "b",
            PreRelease::Rc => "rc",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Version {
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

// Longest spellings first so that "alpha" is not read as "a" + "lpha".
const PRE_SPELLINGS: &[(&str, PreRelease)] = &[
    ("preview", PreRelease::Rc),
    ("alpha", PreRelease::Alpha),
    ("beta", PreRelease::Beta),
    ("pre", PreRelease::Rc),
    ("rc", PreRelease::Rc),
    ("a", PreRelease::Alpha),
    ("b", PreRelease::Beta),
    ("c", PreRelease::Rc),
];

const POST_SPELLINGS: &[&str] = &["post", "rev", "r"];

#[derive(Clone, Copy)]
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn eat(&mut self, prefix: &str) -> bool {
        match self.rest.strip_prefix(prefix) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn eat_separator(&mut self) -> bool {
        self.eat(".") || self.eat("-") || self.eat("_")
    }

    fn number(&mut self) -> Option<u64> {
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let value = self.rest[..end].parse().ok()?;
        self.rest = &self.rest[end..];
        Some(value)
    }

    /// `[sep] spelling [sep] [N]`; restores the cursor on no match.
    fn labelled<T: Copy>(&mut self, spellings: &[(&str, T)]) -> Option<(T, u64)> {
        let mut probe = *self;
        probe.eat_separator();
        let label = spellings
            .iter()
            .find_map(|&(spelling, label)| probe.eat(spelling).then_some(label))?;
        let mut after = probe;
        after.eat_separator();
        let number = match after.number() {
            Some(n) => {
                probe = after;
                n
            }
            None => 0,
        };
        *self = probe;
        Some((label, number))
    }
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::Invalid(input.to_string());
        let lowered = input.trim().to_ascii_lowercase();
        let mut cursor = Cursor { rest: &lowered };
        cursor.eat("v");

        let mut release = vec![cursor.number().ok_or_else(invalid)?];
        loop {
            let mut probe = cursor;
            if !probe.eat(".") {
                break;
            }
            match probe.number() {
                Some(n) => {
                    release.push(n);
                    cursor = probe;
                }
                None => break,
            }
        }

        let pre = cursor.labelled(PRE_SPELLINGS);

        let post_spellings: Vec<(&str, ())> = POST_SPELLINGS.iter().map(|s| (*s, ())).collect();
        let mut post = cursor.labelled(&post_spellings).map(|(_, n)| n);
        if post.is_none() {
            // implicit post release: "1.0-1"
            let mut probe = cursor;
            if probe.eat("-")
                && let Some(n) = probe.number()
            {
                post = Some(n);
                cursor = probe;
            }
        }

        let dev = cursor.labelled(&[("dev", ())]).map(|(_, n)| n);

        if !cursor.rest.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            release,
            pre,
            post,
            dev,
        })
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre(&self) -> Option<(PreRelease, u64)> {
        self.pre
    }

    pub fn post(&self) -> Option<u64> {
        self.post
    }

    pub fn dev(&self) -> Option<u64> {
        self.dev
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    fn trimmed_release(&self) -> &[u64] {
        let len = self
            .release
            .iter()
            .rposition(|&n| n != 0)
            .map_or(0, |i| i + 1);
        &self.release[..len]
    }

    /// Sort key. A dev release of a final version sorts before every
    /// pre-release of it; dev releases sort before the version they develop.
    fn key(&self) -> (&[u64], (u8, u8, u64), (u8, u64), (u8, u64)) {
        let pre = match self.pre {
            None if self.post.is_none() && self.dev.is_some() => (0, 0, 0),
            Some((label, n)) => (1, label as u8, n),
            None => (2, 0, 0),
        };
        let post = match self.post {
            None => (0, 0),
            Some(n) => (1, n),
        };
        let dev = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        (self.trimmed_release(), pre, post, dev)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let release: Vec<String> = self.release.iter().map(|n| n.to_string()).collect();
        f.write_str(&release.join("."))?;
        if let Some((label, n)) = self.pre {
            write!(f, "{}{n}", label.as_str())?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{n}")?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{n}")?;
        }
        Ok(())
    }
}
