//! Minimal OpenSSH client config (`~/.ssh/config`) lookup.
//!
//! Only the options that affect how a connection is opened are read:
//! `HostName`, `Port`, `User`, `IdentityFile` and `ProxyCommand`. As in
//! OpenSSH, the first value obtained for an option wins, except
//! `IdentityFile` which accumulates. `Match` blocks are skipped.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::config::expand_home;
use crate::error::{Error, Result};

/// One `Host` block: its compiled patterns and the options under it.
#[derive(Debug, Clone)]
struct HostBlock {
    include: GlobSet,
    exclude: GlobSet,
    options: Vec<(String, String)>,
}

impl HostBlock {
    /// Compile a whitespace-separated `Host` pattern list. `!` negates.
    fn new(patterns: &str) -> Self {
        let mut include = GlobSetBuilder::new();
        let mut exclude = GlobSetBuilder::new();
        for pattern in patterns.split_whitespace() {
            let (set, pattern) = match pattern.strip_prefix('!') {
                Some(negated) => (&mut exclude, negated),
                None => (&mut include, pattern),
            };
            if let Some(glob) = compile_host_pattern(pattern) {
                set.add(glob);
            }
        }
        Self {
            include: include.build().unwrap_or_else(|_| GlobSet::empty()),
            exclude: exclude.build().unwrap_or_else(|_| GlobSet::empty()),
            options: Vec::new(),
        }
    }

    /// A block that never matches (`Match` blocks are not evaluated).
    fn unmatched() -> Self {
        Self {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
            options: Vec::new(),
        }
    }

    fn matches(&self, alias: &str) -> bool {
        self.include.is_match(alias) && !self.exclude.is_match(alias)
    }
}

/// Compile an OpenSSH host pattern. Only `*` and `?` are wildcards; every
/// other character, including glob syntax like `[` or `{`, is literal.
fn compile_host_pattern(pattern: &str) -> Option<globset::Glob> {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '{' | '}') {
            escaped.push('[');
            escaped.push(c);
            escaped.push(']');
        } else {
            escaped.push(c);
        }
    }
    GlobBuilder::new(&escaped)
        .case_insensitive(true)
        .literal_separator(false)
        .backslash_escape(false)
        .build()
        .ok()
}

/// Connection options resolved for one host alias.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_files: Vec<PathBuf>,
    pub proxy_command: Option<String>,
}

/// Parsed OpenSSH client configuration.
#[derive(Debug, Clone, Default)]
pub struct SshClientConfig {
    blocks: Vec<HostBlock>,
}

impl SshClientConfig {
    /// Default per-user config location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("config"))
    }

    /// Load `~/.ssh/config`, or an empty config when it does not exist.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read ssh config {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        // Options before the first `Host` line apply to every host.
        let mut blocks = vec![HostBlock::new("*")];

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_option(line) else {
                continue;
            };
            match key.as_str() {
                "host" => blocks.push(HostBlock::new(&value)),
                "match" => blocks.push(HostBlock::unmatched()),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((key, value));
                    }
                }
            }
        }

        Self { blocks }
    }

    /// Resolve the options that apply to `alias`.
    pub fn lookup(&self, alias: &str) -> HostOptions {
        let mut resolved = HostOptions::default();
        let mut proxy_seen = false;

        for block in self.blocks.iter().filter(|b| b.matches(alias)) {
            for (key, value) in &block.options {
                match key.as_str() {
                    "hostname" if resolved.hostname.is_none() => {
                        resolved.hostname = Some(value.clone());
                    }
                    "port" if resolved.port.is_none() => {
                        resolved.port = value.parse().ok();
                    }
                    "user" if resolved.user.is_none() => {
                        resolved.user = Some(value.clone());
                    }
                    "identityfile" => {
                        resolved.identity_files.push(expand_home(Path::new(value)));
                    }
                    "proxycommand" if !proxy_seen => {
                        proxy_seen = true;
                        if !value.eq_ignore_ascii_case("none") {
                            resolved.proxy_command = Some(value.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        resolved
    }
}

/// Expand `%h`, `%p`, `%r`, `%n` and `%%` in a `ProxyCommand`.
pub fn expand_proxy_command(template: &str, alias: &str, host: &str, port: u16, user: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(&port.to_string()),
            Some('r') => out.push_str(user),
            Some('n') => out.push_str(alias),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn split_option(line: &str) -> Option<(String, String)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(split_at);
    let value = rest.trim_start().trim_start_matches('=').trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
# global defaults
User fallback

Host bastion
    HostName 131.170.5.132
    User e62439

Host node*.cluster !node9.cluster
    ProxyCommand ssh -o StrictHostKeyChecking=no bastion nc %h %p
    IdentityFile ~/.ssh/cluster_key
    Port 2222

Host *
    IdentityFile ~/.ssh/id_ed25519
    ProxyCommand none
";

    #[test]
    fn first_value_wins() {
        let config = SshClientConfig::parse(SAMPLE);
        let opts = config.lookup("bastion");
        assert_eq!(opts.hostname.as_deref(), Some("131.170.5.132"));
        // Global `User` precedes the host block, so it wins.
        assert_eq!(opts.user.as_deref(), Some("fallback"));
        assert_eq!(opts.proxy_command, None);
    }

    #[test]
    fn wildcard_block_supplies_proxy_and_identities() {
        let config = SshClientConfig::parse(SAMPLE);
        let opts = config.lookup("node3.cluster");
        assert_eq!(
            opts.proxy_command.as_deref(),
            Some("ssh -o StrictHostKeyChecking=no bastion nc %h %p")
        );
        assert_eq!(opts.port, Some(2222));
        assert_eq!(opts.identity_files.len(), 2);
    }

    #[test]
    fn negated_pattern_excludes_host() {
        let config = SshClientConfig::parse(SAMPLE);
        let opts = config.lookup("node9.cluster");
        assert_eq!(opts.proxy_command, None);
        assert_eq!(opts.port, None);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let config = SshClientConfig::parse(SAMPLE);
        assert_eq!(
            config.lookup("BASTION").hostname.as_deref(),
            Some("131.170.5.132")
        );
    }

    #[test]
    fn equals_separator_and_quotes() {
        let config = SshClientConfig::parse("Host box\n  ProxyCommand=\"nc -X connect %h %p\"\n");
        assert_eq!(
            config.lookup("box").proxy_command.as_deref(),
            Some("nc -X connect %h %p")
        );
    }

    #[test]
    fn match_blocks_are_ignored() {
        let config = SshClientConfig::parse("Match host box\n  Port 2200\n");
        assert_eq!(config.lookup("box").port, None);
    }

    #[test]
    fn unknown_host_gets_global_options_only() {
        let config = SshClientConfig::parse(SAMPLE);
        let opts = config.lookup("elsewhere");
        assert_eq!(opts.hostname, None);
        assert_eq!(opts.user.as_deref(), Some("fallback"));
        assert_eq!(opts.identity_files.len(), 1);
    }

    #[test]
    fn expands_proxy_tokens() {
        let cmd = expand_proxy_command("ssh -W %h:%p %r@jump # %n 100%%", "alias", "10.0.0.5", 22, "bob");
        assert_eq!(cmd, "ssh -W 10.0.0.5:22 bob@jump # alias 100%");
    }

    fn block(patterns: &str) -> HostBlock {
        HostBlock::new(patterns)
    }

    #[test]
    fn glob_matching() {
        assert!(block("*").matches("anything"));
        assert!(block("node?").matches("node1"));
        assert!(!block("node?").matches("node12"));
        assert!(block("*.example.com").matches("a.example.com"));
        assert!(!block("*.example.com").matches("example.org"));
        assert!(block("Node?").matches("NODE1"));
    }

    #[test]
    fn glob_syntax_other_than_star_and_question_is_literal() {
        assert!(block("node[1]").matches("node[1]"));
        assert!(!block("node[1]").matches("node1"));
        assert!(block("{a,b}").matches("{a,b}"));
        assert!(!block("{a,b}").matches("a"));
    }

    #[test]
    fn many_stars_against_long_alias() {
        let alias = "a".repeat(4096);
        assert!(!block("*a*a*a*a*a*a*a*a*a*a*a*a*b").matches(&alias));
        assert!(block("*a*a*a*a*a*a*a*a*a*a*a*a*").matches(&alias));
    }

    #[test]
    fn negation_only_block_matches_nothing() {
        assert!(!block("!bad").matches("good"));
        assert!(!block("* !bad").matches("bad"));
        assert!(block("* !bad").matches("good"));
    }
}
