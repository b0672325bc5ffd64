use anyhow::{bail, Result};
use simple_call::{ConnectionState, MediaKind, PeerId, TransientEvent, Update};

/// one line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(PeerId),
    /// answers the ringing call
    Accept,
    Reject,
    HangUp,
    Media(MediaKind, bool),
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };
        let cmd = match verb {
            "call" => match words.next() {
                Some(target) => Command::Call(target.to_string()),
                None => bail!("usage: call <id>"),
            },
            "accept" => Command::Accept,
            "reject" => Command::Reject,
            "hangup" => Command::HangUp,
            "mic" => Command::Media(MediaKind::Audio, parse_switch(words.next())?),
            "cam" => Command::Media(MediaKind::Video, parse_switch(words.next())?),
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command: {}", other),
        };
        Ok(cmd)
    }
}

fn parse_switch(word: Option<&str>) -> Result<bool> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        _ => bail!("expected on or off"),
    }
}

pub const HELP: &str = "commands: call <id> | accept | reject | hangup | mic on|off | cam on|off | quit";

/// what to print for an update
pub fn describe(update: &Update) -> String {
    match update {
        Update::State(ConnectionState::New) => "connecting...".into(),
        Update::State(ConnectionState::WaitingForCall) => "ready".into(),
        Update::State(ConnectionState::UserOffline(peer)) => format!("{} is not available", peer),
        Update::State(ConnectionState::CallingTarget(peer)) => format!("calling {}...", peer),
        Update::State(ConnectionState::ReceivedCall(peer)) => {
            format!("{} is calling. accept or reject?", peer)
        }
        Update::State(ConnectionState::OnCall(peer)) => format!("on a call with {}", peer),
        Update::Event(TransientEvent::ConnectionLost(peer)) => {
            format!("lost the media connection to {}. hangup to end the call", peer)
        }
        Update::Event(event) => format!("! {}", event.message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("call  ab12c").unwrap(), Command::Call("ab12c".into()));
        assert_eq!(Command::parse("accept").unwrap(), Command::Accept);
        assert_eq!(
            Command::parse("mic off").unwrap(),
            Command::Media(MediaKind::Audio, false)
        );
        assert_eq!(
            Command::parse("cam on").unwrap(),
            Command::Media(MediaKind::Video, true)
        );
        assert_eq!(Command::parse("exit").unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("call").is_err());
        assert!(Command::parse("mic maybe").is_err());
        assert!(Command::parse("dance").is_err());
    }

    #[test]
    fn describes_updates() {
        assert_eq!(
            describe(&Update::State(ConnectionState::ReceivedCall("b".into()))),
            "b is calling. accept or reject?"
        );
        assert_eq!(
            describe(&Update::Event(TransientEvent::SelfCall)),
            format!("! {}", TransientEvent::SelfCall.message())
        );
    }
}
