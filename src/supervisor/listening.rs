//! Recognizes the line a notebook server prints once it accepts connections.

use regex::Regex;

/// Matches `http(s)://host:port...`, including the old
/// `http://(hostname or 127.0.0.1):8888/` form.
pub const DEFAULT_LISTENING_PATTERN: &str =
    r"(?P<url>https?://(?:\(\S+ or )?(?P<host>\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9.\-]+)\)?:(?P<port>\d{1,5})\S*)";

/// A matched listening announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningAnnouncement {
    pub host: String,
    pub port: u16,
    /// The URL portion, when the pattern captures one.
    pub url: Option<String>,
    /// The full line it was found in.
    pub line: String,
}

/// Compiled listening pattern. Needs `host` and `port` named groups.
#[derive(Debug, Clone)]
pub struct ListeningPattern {
    regex: Regex,
}

impl ListeningPattern {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid listening pattern '{}': {}", pattern, e))?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        for required in ["host", "port"] {
            if !names.contains(&required) {
                return Err(anyhow::anyhow!(
                    "listening pattern '{}' has no '{}' group",
                    pattern,
                    required
                ));
            }
        }
        Ok(Self { regex })
    }

    /// First announcement in `line` with a usable host and a non-zero port.
    pub fn find(&self, line: &str) -> Option<ListeningAnnouncement> {
        self.regex.captures_iter(line).find_map(|caps| {
            let host = caps.name("host")?.as_str();
            let port: u16 = caps.name("port")?.as_str().parse().ok()?;
            if port == 0 || host.is_empty() {
                return None;
            }
            Some(ListeningAnnouncement {
                host: host.to_string(),
                port,
                url: caps.name("url").map(|m| m.as_str().to_string()),
                line: line.to_string(),
            })
        })
    }
}

impl Default for ListeningPattern {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_LISTENING_PATTERN).expect("default listening pattern is valid"),
        }
    }
}
