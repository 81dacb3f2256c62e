//! Matchers used by policy rules: path templates, CIDR blocks and domains.

use anyhow::{anyhow, Result};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use std::net::IpAddr;
use std::path::{Component, Path};
use std::sync::OnceLock;

/// Placeholders a path template may use. Values are fixed per session.
pub const PLACEHOLDERS: &[&str] = &["HOME", "PROJECT_ROOT", "WORKSPACE", "TMPDIR"];

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn placeholder_re() -> &'static Regex {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Values substituted into path templates when a session binds a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindContext {
    pub home: String,
    pub project_root: String,
    pub tmpdir: String,
}

impl BindContext {
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            home: std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()),
            project_root: workspace.to_string_lossy().to_string(),
            tmpdir: std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string()),
        }
    }

    fn value(&self, placeholder: &str) -> Option<&str> {
        match placeholder {
            "HOME" => Some(&self.home),
            "PROJECT_ROOT" | "WORKSPACE" => Some(&self.project_root),
            "TMPDIR" => Some(&self.tmpdir),
            _ => None,
        }
    }
}

/// A path glob that may still contain `${NAME}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty path pattern"));
        }
        for caps in placeholder_re().captures_iter(raw) {
            let name = &caps[1];
            if !PLACEHOLDERS.contains(&name) {
                return Err(anyhow!("unknown placeholder ${{{}}} in {}", name, raw));
            }
        }
        let skeleton = placeholder_re().replace_all(raw, "/placeholder");
        if !skeleton.starts_with('/') {
            return Err(anyhow!("path pattern must be absolute: {}", raw));
        }
        if skeleton.contains('$') {
            return Err(anyhow!("malformed placeholder in {}", raw));
        }
        Pattern::new(&skeleton).map_err(|e| anyhow!("invalid glob {}: {}", raw, e))?;
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolves placeholders and compiles the glob. A trailing `/**` also
    /// matches the directory itself.
    pub fn bind(&self, ctx: &BindContext) -> Result<Vec<Pattern>> {
        let mut missing = None;
        let resolved = placeholder_re().replace_all(&self.raw, |caps: &regex::Captures<'_>| {
            match ctx.value(&caps[1]) {
                Some(value) => Pattern::escape(value.trim_end_matches('/')),
                None => {
                    missing = Some(caps[1].to_string());
                    String::new()
                }
            }
        });
        if let Some(name) = missing {
            return Err(anyhow!("placeholder ${{{}}} has no value", name));
        }
        let resolved = resolved.to_string();
        let mut patterns = Vec::with_capacity(2);
        if let Some(base) = resolved.strip_suffix("/**") {
            let base = if base.is_empty() { "/" } else { base };
            patterns.push(Pattern::new(base).map_err(|e| anyhow!("invalid glob {}: {}", base, e))?);
        }
        patterns.push(
            Pattern::new(&resolved).map_err(|e| anyhow!("invalid glob {}: {}", resolved, e))?,
        );
        Ok(patterns)
    }
}

pub fn path_matches(patterns: &[Pattern], path: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern.matches_with(path, PATH_MATCH))
}

/// Lexically normalizes an absolute path, folding `.` and `..`.
pub fn normalize_path(path: &str) -> Result<String> {
    let candidate = Path::new(path);
    if !candidate.is_absolute() {
        return Err(anyhow!("path is not absolute: {}", path));
    }
    let mut parts: Vec<String> = Vec::new();
    for component in candidate.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::Prefix(_) => return Err(anyhow!("unsupported path prefix: {}", path)),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// An address block in CIDR notation. A bare address is a single host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| anyhow!("invalid prefix length in {}", raw))?;
                (addr, Some(prefix))
            }
            None => (raw, None),
        };
        let network: IpAddr = addr
            .parse()
            .map_err(|_| anyhow!("invalid address in {}", raw))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(anyhow!("prefix length {} exceeds {} in {}", prefix, max, raw));
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            other => other,
        };
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(u32::from(net) as u128, u32::from(ip) as u128, self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(u128::from(net), u128::from(ip), self.prefix, 128)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn prefix_eq(a: u128, b: u128, prefix: u8, width: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = width - prefix as u32;
    (a >> shift) == (b >> shift)
}

/// Hostname matcher: exact, `*.suffix` (subdomains only) or `.suffix`
/// (the domain and its subdomains).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    Subdomains(String),
    DomainAndSubdomains(String),
}

impl DomainPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        let (pattern, name) = if let Some(rest) = value.strip_prefix("*.") {
            (DomainPattern::Subdomains(rest.to_string()), rest.to_string())
        } else if let Some(rest) = value.strip_prefix('.') {
            (
                DomainPattern::DomainAndSubdomains(rest.to_string()),
                rest.to_string(),
            )
        } else {
            (DomainPattern::Exact(value.clone()), value.clone())
        };
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !name.starts_with('.')
            && !name.contains("..");
        if !valid {
            return Err(anyhow!("invalid domain pattern {}", raw));
        }
        Ok(pattern)
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        match self {
            DomainPattern::Exact(name) => host == *name,
            DomainPattern::Subdomains(suffix) => is_subdomain(&host, suffix),
            DomainPattern::DomainAndSubdomains(suffix) => {
                host == *suffix || is_subdomain(&host, suffix)
            }
        }
    }
}

fn is_subdomain(host: &str, suffix: &str) -> bool {
    host.len() > suffix.len() + 1
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

/// Parses a connect target host into an address if it is a literal IP.
pub fn host_addr(host: &str) -> Option<IpAddr> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed.parse().ok()
}
