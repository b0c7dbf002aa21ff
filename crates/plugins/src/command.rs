use std::fmt;

use regex::Regex;

const TRIM: &[char] = &['\r', '\n', '\t', ' '];

/// The first logical line of a comment, with surrounding whitespace removed.
pub fn extract_command(body: &str) -> &str {
    let body = body.trim_start_matches(TRIM);
    let line = body.split_once('\n').map_or(body, |(line, _)| line);
    line.trim_end_matches(TRIM)
}

/// The single argument every command takes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RefArg {
    /// Most recent tag of the repository.
    Latest,
    /// The head commit of the pull request.
    Current,
    /// A branch or version literal.
    Named(String),
}

impl RefArg {
    fn parse(arg: &str) -> Self {
        match arg.to_ascii_lowercase().as_str() {
            "latest" => Self::Latest,
            "current" => Self::Current,
            lower @ ("master" | "main") => Self::Named(lower.to_string()),
            _ => Self::Named(arg.to_string()),
        }
    }
}

impl fmt::Display for RefArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Current => f.write_str("current"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandMatch {
    pub name: &'static str,
    pub reference: RefArg,
}

/// Named command patterns, tried in registration order.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    patterns: Vec<(&'static str, Regex)>,
}

impl CommandSet {
    pub fn new() -> Self { Self::default() }

    /// Add `/<keyword> <ref>` under `name`.
    pub fn with(mut self, name: &'static str, keyword: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!(
            r"(?i)^/{}\s+(master|main|latest|current|v[0-9]+\.[0-9]+\.[0-9]+\S*)$",
            regex::escape(keyword)
        ))?;
        self.patterns.push((name, regex));
        Ok(self)
    }

    /// Match the first line of `body` against every pattern. The first pattern that
    /// matches the whole line wins.
    pub fn find(&self, body: &str) -> Option<CommandMatch> {
        let command = extract_command(body);
        self.patterns.iter().find_map(|(name, regex)| {
            let caps = regex.captures(command)?;
            Some(CommandMatch { name: *name, reference: RefArg::parse(caps.get(1)?.as_str()) })
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.patterns.iter().map(|(name, _)| *name)
    }
}
