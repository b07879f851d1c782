//! Interactive commands read from stdin.

use anyhow::{Context, Result, bail};

pub const HELP: &str = "\
Commands:
  /peers                    list connected peers
  /connect IP:PORT          connect to a peer
  /share URL [TITLE]        share a page with everyone
  /history URL [TITLE]      share a history entry
  /bookmark URL [TITLE]     share a bookmark
  /msg PEER_ID TEXT         send a chat message to one peer
  /help                     show this help
  /quit                     leave the network and exit
Anything else is sent to every peer as chat.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Connect { host: String, port: u16 },
    Share { url: String, title: String },
    History { url: String, title: String },
    Bookmark { url: String, title: String },
    Msg { peer_id: String, text: String },
    Chat(String),
    Help,
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if !line.starts_with('/') {
            return Ok(Some(Self::Chat(line.to_string())));
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let command = match name {
            "/peers" => Self::Peers,
            "/help" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            "/connect" => {
                if rest.is_empty() {
                    bail!("usage: /connect IP:PORT");
                }
                let (host, port) = split_host_port(rest)?;
                Self::Connect { host, port }
            }
            "/share" => {
                let (url, title) = url_and_title(rest, "/share")?;
                Self::Share { url, title }
            }
            "/history" => {
                let (url, title) = url_and_title(rest, "/history")?;
                Self::History { url, title }
            }
            "/bookmark" => {
                let (url, title) = url_and_title(rest, "/bookmark")?;
                Self::Bookmark { url, title }
            }
            "/msg" => match rest.split_once(char::is_whitespace) {
                Some((peer_id, text)) if !text.trim().is_empty() => Self::Msg {
                    peer_id: peer_id.to_string(),
                    text: text.trim().to_string(),
                },
                _ => bail!("usage: /msg PEER_ID TEXT"),
            },
            other => bail!("unknown command {other} (try /help)"),
        };
        Ok(Some(command))
    }
}

/// Split `ip:port`, accepting bracketed IPv6 (`[::1]:9001`).
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("expected IP:PORT, got {addr}"))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {addr}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("missing host in {addr}");
    }
    Ok((host.to_string(), port))
}

/// `URL [TITLE]`; the title defaults to the URL.
fn url_and_title(rest: &str, command: &str) -> Result<(String, String)> {
    match rest.split_once(char::is_whitespace) {
        Some((url, title)) => Ok((url.to_string(), title.trim().to_string())),
        None if !rest.is_empty() => Ok((rest.to_string(), rest.to_string())),
        None => bail!("usage: {command} URL [TITLE]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(parse("  hello there "), Command::Chat("hello there".into()));
        assert!(Command::parse("   ").unwrap().is_none());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("/peers"), Command::Peers);
        assert_eq!(parse("/quit"), Command::Quit);
        assert_eq!(parse("/help"), Command::Help);
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            parse("/connect 192.168.1.20:9001"),
            Command::Connect {
                host: "192.168.1.20".into(),
                port: 9001
            }
        );
        assert_eq!(
            parse("/connect [::1]:9002"),
            Command::Connect {
                host: "::1".into(),
                port: 9002
            }
        );
        assert!(Command::parse("/connect").is_err());
        assert!(Command::parse("/connect 10.0.0.1").is_err());
        assert!(Command::parse("/connect 10.0.0.1:99999").is_err());
    }

    #[test]
    fn test_url_commands() {
        assert_eq!(
            parse("/share https://example.com Example Domain"),
            Command::Share {
                url: "https://example.com".into(),
                title: "Example Domain".into()
            }
        );
        assert_eq!(
            parse("/bookmark https://rust-lang.org"),
            Command::Bookmark {
                url: "https://rust-lang.org".into(),
                title: "https://rust-lang.org".into()
            }
        );
        assert!(matches!(parse("/history https://a A"), Command::History { .. }));
        assert!(Command::parse("/share").is_err());
    }

    #[test]
    fn test_msg() {
        assert_eq!(
            parse("/msg abc-123 see you soon"),
            Command::Msg {
                peer_id: "abc-123".into(),
                text: "see you soon".into()
            }
        );
        assert!(Command::parse("/msg abc-123").is_err());
        assert!(Command::parse("/msg").is_err());
    }

    #[test]
    fn test_unknown_command() {
        let err = Command::parse("/dance").unwrap_err();
        assert!(err.to_string().contains("/dance"));
    }
}
