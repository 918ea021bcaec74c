use super::types::{PeerAddress, PeerId};

pub const USAGE: &str = "Available commands:
  peers                          - List known peers
  connect <peer_id> [host:port]  - Connect to a peer (address optional if already known)
  send <peer_id> <message>       - Send a message to a peer
  history <peer_id> [limit]      - Show conversation history
  flush <peer_id>                - Retry pending messages for a peer
  whoami                         - Show the local peer id and listen address
  exit                           - Exit the application";

/// A line typed into the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Peers,
    Connect {
        peer_id: PeerId,
        address: Option<PeerAddress>,
    },
    Send {
        peer_id: PeerId,
        content: String,
    },
    History {
        peer_id: PeerId,
        limit: Option<usize>,
    },
    Flush {
        peer_id: PeerId,
    },
    WhoAmI,
    Help,
    Exit,
}

impl ShellCommand {
    /// Parses one shell line. `Ok(None)` for a blank line, `Err` carries a usage hint.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_lowercase().as_str() {
            "peers" => Self::Peers,
            "whoami" => Self::WhoAmI,
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            "connect" => {
                let mut parts = rest.split_whitespace();
                let peer_id = parts
                    .next()
                    .ok_or("Usage: connect <peer_id> [host:port]")?;
                let address = match parts.next() {
                    Some(raw) => Some(raw.parse::<PeerAddress>().map_err(|e| e.to_string())?),
                    None => None,
                };
                Self::Connect {
                    peer_id: PeerId::from(peer_id),
                    address,
                }
            }
            "send" => {
                let Some((peer_id, content)) = rest.split_once(char::is_whitespace) else {
                    return Err("Usage: send <peer_id> <message>".into());
                };
                let content = content.trim();
                if content.is_empty() {
                    return Err("Usage: send <peer_id> <message>".into());
                }
                Self::Send {
                    peer_id: PeerId::from(peer_id),
                    content: content.to_string(),
                }
            }
            "history" => {
                let mut parts = rest.split_whitespace();
                let peer_id = parts.next().ok_or("Usage: history <peer_id> [limit]")?;
                let limit = match parts.next() {
                    Some(raw) => Some(
                        raw.parse::<usize>()
                            .map_err(|_| format!("invalid limit `{raw}`"))?,
                    ),
                    None => None,
                };
                Self::History {
                    peer_id: PeerId::from(peer_id),
                    limit,
                }
            }
            "flush" => {
                let peer_id = rest
                    .split_whitespace()
                    .next()
                    .ok_or("Usage: flush <peer_id>")?;
                Self::Flush {
                    peer_id: PeerId::from(peer_id),
                }
            }
            other => {
                return Err(format!(
                    "Unknown command `{other}`. Type 'help' for available commands."
                ));
            }
        };

        Ok(Some(command))
    }
}
