//! Session URL extraction from workflow logs.
//!
//! The workflow prints a one-time connection URL (`https://sshx.io/s/<id>` by default).
//! Extraction is a pure scan over the whole text: the last complete match wins.
//! A match touching the end of the text may still be growing (the log was cut
//! mid-line), so it is never trusted.

use regex::Regex;

use crate::core::config::SessionPatternConfig;

#[derive(Debug, Clone)]
pub struct SessionExtractor {
    pattern: Regex,
    scheme: String,
    host: String,
    path_prefix: String,
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl SessionExtractor {
    pub fn new(config: &SessionPatternConfig) -> Result<Self, regex::Error> {
        let scheme = regex::escape(&config.scheme);
        let optional = if config.allow_bare_host { "?" } else { "" };
        let pattern = format!(
            r"(?:(?P<scheme>{})://){}{}{}(?P<id>[A-Za-z0-9_-]+)",
            scheme,
            optional,
            regex::escape(&config.host),
            regex::escape(&config.path_prefix),
        );
        Ok(Self {
            pattern: Regex::new(&pattern)?,
            scheme: config.scheme.clone(),
            host: config.host.clone(),
            path_prefix: config.path_prefix.clone(),
        })
    }

    /// Return the most recently emitted complete session URL in `log`, normalized
    /// to `scheme://host<prefix><id>`.
    pub fn extract(&self, log: &str) -> Option<String> {
        let mut latest = None;
        for caps in self.pattern.captures_iter(log) {
            let (Some(whole), Some(id)) = (caps.get(0), caps.name("id")) else {
                continue;
            };
            if whole.end() >= log.len() {
                continue;
            }
            if caps.name("scheme").is_none() {
                // A bare host must start a token, not continue one (`evilsshx.io`, `http://sshx.io`).
                let preceding = log[..whole.start()].chars().next_back();
                if preceding.is_some_and(|c| is_id_char(c) || c == '.' || c == '/') {
                    continue;
                }
            }
            latest = Some(format!(
                "{}://{}{}{}",
                self.scheme,
                self.host,
                self.path_prefix,
                id.as_str()
            ));
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sshx() -> SessionExtractor {
        SessionExtractor::new(&SessionPatternConfig::default()).unwrap()
    }

    fn tunnel() -> SessionExtractor {
        SessionExtractor::new(&SessionPatternConfig {
            scheme: "wss".to_string(),
            host: "tunnel.example".to_string(),
            path_prefix: "/".to_string(),
            allow_bare_host: false,
        })
        .unwrap()
    }

    #[test]
    fn finds_url_in_log_line() {
        let log = "2026-01-01T00:00:00Z sshx v0.2\n  ➜  Link:  https://sshx.io/s/AbC_12-x#k3y\n";
        assert_eq!(
            sshx().extract(log),
            Some("https://sshx.io/s/AbC_12-x".to_string())
        );
    }

    #[test]
    fn returns_none_without_match() {
        assert_eq!(sshx().extract(""), None);
        assert_eq!(sshx().extract("booting...\n"), None);
    }

    #[test]
    fn last_match_wins() {
        let log = "https://sshx.io/s/first\nrestarting\nhttps://sshx.io/s/second\n";
        assert_eq!(
            sshx().extract(log),
            Some("https://sshx.io/s/second".to_string())
        );
    }

    #[test]
    fn bare_host_is_normalized() {
        let log = "share: sshx.io/s/bare42\n";
        assert_eq!(
            sshx().extract(log),
            Some("https://sshx.io/s/bare42".to_string())
        );
    }

    #[test]
    fn bare_host_inside_another_token_is_ignored() {
        assert_eq!(sshx().extract("see evilsshx.io/s/nope\n"), None);
        assert_eq!(sshx().extract("http://sshx.io/s/plain\n"), None);
    }

    #[test]
    fn match_at_end_of_text_is_not_trusted() {
        let partial = "connect: https://sshx.io/s/abc";
        assert_eq!(sshx().extract(partial), None);
        let complete = "connect: https://sshx.io/s/abc123\n";
        assert_eq!(
            sshx().extract(complete),
            Some("https://sshx.io/s/abc123".to_string())
        );
    }

    #[test]
    fn partial_newer_match_keeps_older_complete_one() {
        let log = "https://sshx.io/s/old\nhttps://sshx.io/s/ne";
        assert_eq!(sshx().extract(log), Some("https://sshx.io/s/old".to_string()));
    }

    #[test]
    fn custom_grammar_requires_scheme() {
        let log = "booting...\nconnect: wss://tunnel.example/abc123\n";
        assert_eq!(
            tunnel().extract(log),
            Some("wss://tunnel.example/abc123".to_string())
        );
        assert_eq!(tunnel().extract("tunnel.example/abc123\n"), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        let log = "a https://sshx.io/s/one\nb https://sshx.io/s/two\n";
        let ex = sshx();
        assert_eq!(ex.extract(log), ex.extract(log));
    }

    #[test]
    fn growing_log_never_regresses() {
        let full = "boot\nhttps://sshx.io/s/aaa\nnoise sshx.io/s/bbb more\nhttps://sshx.io/s/ccc#x\nend\n";
        let ex = sshx();
        let order = ["https://sshx.io/s/aaa", "https://sshx.io/s/bbb", "https://sshx.io/s/ccc"];
        let mut last_rank: Option<usize> = None;
        for cut in (0..=full.len()).filter(|i| full.is_char_boundary(*i)) {
            let found = ex.extract(&full[..cut]);
            match (last_rank, found) {
                (Some(_), None) => panic!("result disappeared at cut {}", cut),
                (_, Some(url)) => {
                    let rank = order
                        .iter()
                        .position(|u| *u == url)
                        .unwrap_or_else(|| panic!("false match {} at cut {}", url, cut));
                    if let Some(prev) = last_rank {
                        assert!(rank >= prev, "regressed at cut {}", cut);
                    }
                    last_rank = Some(rank);
                }
                (None, None) => {}
            }
        }
        assert_eq!(last_rank, Some(2));
    }
}
