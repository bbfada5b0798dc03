//! Wire messages exchanged among replicas and clients, and their text codec.
//!
//! Every frame is one line of colon-separated fields led by a kind tag. The
//! last field of a message kind that carries a value (chat payload, accepted
//! value) extends to the end of the line and may itself contain colons.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::utils::PaxosLogError;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Client ID type.
pub type ClientId = u64;

/// Per-client chat sequence number type.
pub type SeqNum = u64;

/// Proposal (round) number type.
pub type Ballot = u64;

/// Log slot index type.
pub type SlotIdx = usize;

/// Proposal number marking a log slot as chosen.
pub const CHOSEN_BALLOT: Ballot = Ballot::MAX;

/// Literal placeholder for an absent value on the wire.
pub const EMPTY_PLACEHOLDER: &str = "|EMPTY_MESSAGE|";

/// Identifies one chat request of one client; the deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatMessageId {
    pub client: ClientId,
    pub seq: SeqNum,
}

impl ChatMessageId {
    pub fn new(client: ClientId, seq: SeqNum) -> Self {
        ChatMessageId { client, seq }
    }
}

/// All message kinds, decoded from wire text at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaxosMsg {
    /// Client asks whether the receiver is leader; `addr` is where the
    /// client listens for replies.
    Hello { client: ClientId, addr: SocketAddr },

    /// Client submits a chat payload.
    Chat {
        client: ClientId,
        seq: SeqNum,
        payload: String,
    },

    /// Receiver of a Hello is the leader.
    Ack,

    /// Receiver of a Hello or Chat is not the leader; redirect.
    Nack { leader: ReplicaId },

    /// Chat with this sequence number has been committed.
    Response { seq: SeqNum },

    /// Leader liveness beacon.
    HeartBeat { view: u64, timestamp: u64 },

    /// Phase 1a.
    Prepare {
        round: Ballot,
        slot: SlotIdx,
        client: ClientId,
        seq: SeqNum,
    },

    /// Phase 1b. `accepted` is the proposal number stored at `slot` on the
    /// responder (0 if nothing is stored there).
    PrepareReply {
        accepted: Ballot,
        slot: SlotIdx,
        from: ReplicaId,
        no_more_accepted: bool,
        client: ClientId,
        seq: SeqNum,
        value: Option<String>,
    },

    /// Phase 2a.
    Accept {
        round: Ballot,
        slot: SlotIdx,
        first_unchosen: SlotIdx,
        client: ClientId,
        seq: SeqNum,
        value: String,
    },

    /// Phase 2b.
    AcceptReply {
        min_proposal: Ballot,
        first_unchosen: SlotIdx,
        from: ReplicaId,
        client: ClientId,
        seq: SeqNum,
    },

    /// Slot `slot` is chosen with `value`.
    Success { slot: SlotIdx, value: String },

    /// Acknowledges a Success, reporting the responder's frontier.
    SuccessReply {
        first_unchosen: SlotIdx,
        slot: SlotIdx,
        from: ReplicaId,
    },
}

/// Checks that a chat payload survives the wire unchanged: it must stay on
/// one line and must not read back as the absent-value placeholder.
pub fn check_payload(payload: &str) -> Result<(), PaxosLogError> {
    if payload.contains(['\n', '\r']) {
        Err(PaxosLogError::msg("payload contains a line break"))
    } else if payload == EMPTY_PLACEHOLDER {
        Err(PaxosLogError::msg(format!(
            "payload equals reserved placeholder '{}'",
            EMPTY_PLACEHOLDER
        )))
    } else {
        Ok(())
    }
}

impl PaxosMsg {
    /// Encodes into one wire frame (without the newline). Fails if a carried
    /// value would not decode back to itself.
    pub fn encode(&self) -> Result<String, PaxosLogError> {
        match self {
            PaxosMsg::Chat { payload: value, .. }
            | PaxosMsg::Accept { value, .. }
            | PaxosMsg::Success { value, .. }
            | PaxosMsg::PrepareReply {
                value: Some(value), ..
            } => check_payload(value)?,
            _ => {}
        }
        Ok(self.to_string())
    }

    /// Decodes one wire frame (without the newline).
    pub fn decode(line: &str) -> Result<Self, PaxosLogError> {
        line.parse()
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PaxosMsg::Hello { .. } => "Hello",
            PaxosMsg::Chat { .. } => "Chat",
            PaxosMsg::Ack => "Ack",
            PaxosMsg::Nack { .. } => "Nack",
            PaxosMsg::Response { .. } => "Response",
            PaxosMsg::HeartBeat { .. } => "HeartBeat",
            PaxosMsg::Prepare { .. } => "Prepare",
            PaxosMsg::PrepareReply { .. } => "PrepareReply",
            PaxosMsg::Accept { .. } => "Accept",
            PaxosMsg::AcceptReply { .. } => "AcceptReply",
            PaxosMsg::Success { .. } => "Success",
            PaxosMsg::SuccessReply { .. } => "SuccessReply",
        }
    }
}

impl fmt::Display for PaxosMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PaxosMsg::Hello { client, addr } => {
                write!(f, "CLIENT_TO_SERVER:HELLO:{}:{}", client, addr)
            }
            PaxosMsg::Chat {
                client,
                seq,
                payload,
            } => write!(f, "CLIENT_TO_SERVER:CHAT:{}:{}:{}", client, seq, payload),
            PaxosMsg::Ack => write!(f, "SERVER_TO_CLIENT:ACK"),
            PaxosMsg::Nack { leader } => {
                write!(f, "SERVER_TO_CLIENT:NACK:{}", leader)
            }
            PaxosMsg::Response { seq } => {
                write!(f, "SERVER_TO_CLIENT:RESPONSE:{}", seq)
            }
            PaxosMsg::HeartBeat { view, timestamp } => {
                write!(f, "HEART_BEAT:{}:{}", view, timestamp)
            }
            PaxosMsg::Prepare {
                round,
                slot,
                client,
                seq,
            } => write!(f, "PREPARE:{}:{}:{}:{}", round, slot, client, seq),
            PaxosMsg::PrepareReply {
                accepted,
                slot,
                from,
                no_more_accepted,
                client,
                seq,
                value,
            } => write!(
                f,
                "PREPARE_RESPONSE:{}:{}:{}:{}:{}:{}:{}",
                accepted,
                slot,
                from,
                no_more_accepted,
                client,
                seq,
                value.as_deref().unwrap_or(EMPTY_PLACEHOLDER)
            ),
            PaxosMsg::Accept {
                round,
                slot,
                first_unchosen,
                client,
                seq,
                value,
            } => write!(
                f,
                "ACCEPT:{}:{}:{}:{}:{}:{}",
                round, slot, first_unchosen, client, seq, value
            ),
            PaxosMsg::AcceptReply {
                min_proposal,
                first_unchosen,
                from,
                client,
                seq,
            } => write!(
                f,
                "ACCEPT_RESPONSE:{}:{}:{}:{}:{}",
                min_proposal, first_unchosen, from, client, seq
            ),
            PaxosMsg::Success { slot, value } => {
                write!(f, "SUCCESS:{}:{}", slot, value)
            }
            PaxosMsg::SuccessReply {
                first_unchosen,
                slot,
                from,
            } => write!(
                f,
                "SUCCESS_RESPONSE:{}:{}:{}",
                first_unchosen, slot, from
            ),
        }
    }
}

/// Parses the `ip:port` tail of a Hello. The port is the last field, so an
/// IPv6 address may appear with or without brackets.
fn parse_listen_addr(tail: &str) -> Result<SocketAddr, PaxosLogError> {
    let invalid =
        || PaxosLogError::msg(format!("invalid listen address '{}'", tail));
    let (ip, port) = tail.rsplit_once(':').ok_or_else(invalid)?;
    let ip = ip
        .strip_prefix('[')
        .and_then(|ip| ip.strip_suffix(']'))
        .unwrap_or(ip);
    let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

/// Cursor over the colon-separated fields of one frame.
struct Fields<'a> {
    line: &'a str,
    rest: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Fields {
            line,
            rest: Some(line),
        }
    }

    /// Takes the next field as a raw string slice.
    fn next_str(&mut self) -> Result<&'a str, PaxosLogError> {
        let rest = self.rest.ok_or_else(|| {
            PaxosLogError::msg(format!("missing field in '{}'", self.line))
        })?;
        match rest.find(':') {
            Some(pos) => {
                self.rest = Some(&rest[pos + 1..]);
                Ok(&rest[..pos])
            }
            None => {
                self.rest = None;
                Ok(rest)
            }
        }
    }

    /// Takes the next field parsed as `T`.
    fn next<T>(&mut self) -> Result<T, PaxosLogError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let field = self.next_str()?;
        field.parse().map_err(|e| {
            PaxosLogError::msg(format!(
                "invalid field '{}' in '{}': {}",
                field, self.line, e
            ))
        })
    }

    /// Takes everything left, colons included.
    fn rest(&mut self) -> Result<&'a str, PaxosLogError> {
        self.rest.take().ok_or_else(|| {
            PaxosLogError::msg(format!("missing value in '{}'", self.line))
        })
    }

    /// Asserts that no field is left.
    fn finish(&self) -> Result<(), PaxosLogError> {
        match self.rest {
            None => Ok(()),
            Some(_) => Err(PaxosLogError::msg(format!(
                "trailing fields in '{}'",
                self.line
            ))),
        }
    }
}

impl FromStr for PaxosMsg {
    type Err = PaxosLogError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = Fields::new(line);
        let msg = match fields.next_str()? {
            "CLIENT_TO_SERVER" => match fields.next_str()? {
                "HELLO" => PaxosMsg::Hello {
                    client: fields.next()?,
                    addr: parse_listen_addr(fields.rest()?)?,
                },
                "CHAT" => PaxosMsg::Chat {
                    client: fields.next()?,
                    seq: fields.next()?,
                    payload: fields.rest()?.into(),
                },
                sub => {
                    return Err(PaxosLogError::msg(format!(
                        "unknown client message type '{}'",
                        sub
                    )))
                }
            },
            "SERVER_TO_CLIENT" => match fields.next_str()? {
                "ACK" => PaxosMsg::Ack,
                "NACK" => PaxosMsg::Nack {
                    leader: fields.next()?,
                },
                "RESPONSE" => PaxosMsg::Response {
                    seq: fields.next()?,
                },
                sub => {
                    return Err(PaxosLogError::msg(format!(
                        "unknown server message type '{}'",
                        sub
                    )))
                }
            },
            "HEART_BEAT" => PaxosMsg::HeartBeat {
                view: fields.next()?,
                timestamp: fields.next()?,
            },
            "PREPARE" => PaxosMsg::Prepare {
                round: fields.next()?,
                slot: fields.next()?,
                client: fields.next()?,
                seq: fields.next()?,
            },
            "PREPARE_RESPONSE" => PaxosMsg::PrepareReply {
                accepted: fields.next()?,
                slot: fields.next()?,
                from: fields.next()?,
                no_more_accepted: fields.next()?,
                client: fields.next()?,
                seq: fields.next()?,
                value: match fields.rest()? {
                    EMPTY_PLACEHOLDER => None,
                    value => Some(value.into()),
                },
            },
            "ACCEPT" => PaxosMsg::Accept {
                round: fields.next()?,
                slot: fields.next()?,
                first_unchosen: fields.next()?,
                client: fields.next()?,
                seq: fields.next()?,
                value: fields.rest()?.into(),
            },
            "ACCEPT_RESPONSE" => PaxosMsg::AcceptReply {
                min_proposal: fields.next()?,
                first_unchosen: fields.next()?,
                from: fields.next()?,
                client: fields.next()?,
                seq: fields.next()?,
            },
            "SUCCESS" => PaxosMsg::Success {
                slot: fields.next()?,
                value: fields.rest()?.into(),
            },
            "SUCCESS_RESPONSE" => PaxosMsg::SuccessReply {
                first_unchosen: fields.next()?,
                slot: fields.next()?,
                from: fields.next()?,
            },
            tag => {
                return Err(PaxosLogError::msg(format!(
                    "unknown message type '{}'",
                    tag
                )))
            }
        };

        fields.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    #[test]
    fn decode_prepare_reply() -> Result<(), PaxosLogError> {
        let msg =
            PaxosMsg::decode("PREPARE_RESPONSE:0:1:2:true:1539876988101:45:Hello")?;
        assert_eq!(
            msg,
            PaxosMsg::PrepareReply {
                accepted: 0,
                slot: 1,
                from: 2,
                no_more_accepted: true,
                client: 1539876988101,
                seq: 45,
                value: Some("Hello".into()),
            }
        );
        let empty = PaxosMsg::decode(
            "PREPARE_RESPONSE:0:1:2:false:1539876988101:45:|EMPTY_MESSAGE|",
        )?;
        assert!(matches!(empty, PaxosMsg::PrepareReply { value: None, .. }));
        Ok(())
    }

    #[test]
    fn encode_absent_value() {
        let msg = PaxosMsg::PrepareReply {
            accepted: 0,
            slot: 3,
            from: 1,
            no_more_accepted: true,
            client: 9,
            seq: 4,
            value: None,
        };
        assert_eq!(
            msg.to_string(),
            "PREPARE_RESPONSE:0:3:1:true:9:4:|EMPTY_MESSAGE|"
        );
    }

    #[test]
    fn payload_keeps_colons() -> Result<(), PaxosLogError> {
        let chat = PaxosMsg::Chat {
            client: 1539876988101,
            seq: 23,
            payload: "Hi there: a:b:".into(),
        };
        let line = chat.to_string();
        assert_eq!(line, "CLIENT_TO_SERVER:CHAT:1539876988101:23:Hi there: a:b:");
        assert_eq!(PaxosMsg::decode(&line)?, chat);

        let accept = PaxosMsg::decode("ACCEPT:0:1:7:1539876988101:45:x:y")?;
        assert!(
            matches!(accept, PaxosMsg::Accept { ref value, first_unchosen: 7, .. } if value == "x:y")
        );
        Ok(())
    }

    #[test]
    fn empty_chat_payload() -> Result<(), PaxosLogError> {
        assert_eq!(
            PaxosMsg::decode("CLIENT_TO_SERVER:CHAT:5:0:")?,
            PaxosMsg::Chat {
                client: 5,
                seq: 0,
                payload: String::new(),
            }
        );
        assert!(PaxosMsg::decode("CLIENT_TO_SERVER:CHAT:5:0").is_err());
        Ok(())
    }

    #[test]
    fn decode_client_frames() -> Result<(), PaxosLogError> {
        assert_eq!(
            PaxosMsg::decode("CLIENT_TO_SERVER:HELLO:1539876988101:68.232.15.233:28779")?,
            PaxosMsg::Hello {
                client: 1539876988101,
                addr: "68.232.15.233:28779".parse()?,
            }
        );
        assert_eq!(PaxosMsg::decode("SERVER_TO_CLIENT:ACK")?, PaxosMsg::Ack);
        assert_eq!(
            PaxosMsg::decode("SERVER_TO_CLIENT:NACK:2")?,
            PaxosMsg::Nack { leader: 2 }
        );
        assert_eq!(
            PaxosMsg::decode("SERVER_TO_CLIENT:RESPONSE:23")?,
            PaxosMsg::Response { seq: 23 }
        );
        Ok(())
    }

    #[test]
    fn hello_listen_addresses() -> Result<(), PaxosLogError> {
        for addr in ["[::1]:5000", "[fe80::1:2]:28779", "10.0.0.7:5001"] {
            let hello = PaxosMsg::Hello {
                client: 5,
                addr: addr.parse()?,
            };
            assert_eq!(PaxosMsg::decode(&hello.encode()?)?, hello);
        }
        assert_eq!(
            PaxosMsg::decode("CLIENT_TO_SERVER:HELLO:5:::1:5000")?,
            PaxosMsg::Hello {
                client: 5,
                addr: "[::1]:5000".parse()?,
            }
        );
        assert!(PaxosMsg::decode("CLIENT_TO_SERVER:HELLO:5:::1").is_err());
        assert!(PaxosMsg::decode("CLIENT_TO_SERVER:HELLO:5:host:80").is_err());
        Ok(())
    }

    #[test]
    fn encode_refuses_unsafe_values() -> Result<(), PaxosLogError> {
        assert!(check_payload("a:b|c").is_ok());
        assert!(check_payload("").is_ok());
        let chat = |payload: &str| PaxosMsg::Chat {
            client: 1,
            seq: 0,
            payload: payload.into(),
        };
        assert!(chat("line1\nline2").encode().is_err());
        assert!(chat("cr\r").encode().is_err());
        assert!(chat(EMPTY_PLACEHOLDER).encode().is_err());
        assert!(PaxosMsg::Success {
            slot: 0,
            value: "x\ny".into(),
        }
        .encode()
        .is_err());
        assert!(PaxosMsg::PrepareReply {
            accepted: 3,
            slot: 0,
            from: 1,
            no_more_accepted: false,
            client: 1,
            seq: 0,
            value: Some(EMPTY_PLACEHOLDER.into()),
        }
        .encode()
        .is_err());
        assert_eq!(chat("ok").encode()?, "CLIENT_TO_SERVER:CHAT:1:0:ok");
        Ok(())
    }

    #[test]
    fn decode_replica_frames() -> Result<(), PaxosLogError> {
        assert_eq!(
            PaxosMsg::decode("HEART_BEAT:0:1539876988101")?,
            PaxosMsg::HeartBeat {
                view: 0,
                timestamp: 1539876988101,
            }
        );
        assert_eq!(
            PaxosMsg::decode("ACCEPT_RESPONSE:23:10:2:1539876988101:45")?,
            PaxosMsg::AcceptReply {
                min_proposal: 23,
                first_unchosen: 10,
                from: 2,
                client: 1539876988101,
                seq: 45,
            }
        );
        assert_eq!(
            PaxosMsg::decode("SUCCESS_RESPONSE:9:7:12")?,
            PaxosMsg::SuccessReply {
                first_unchosen: 9,
                slot: 7,
                from: 12,
            }
        );
        let chosen = PaxosMsg::PrepareReply {
            accepted: CHOSEN_BALLOT,
            slot: 0,
            from: 0,
            no_more_accepted: false,
            client: 1,
            seq: 1,
            value: Some("v".into()),
        };
        assert_eq!(PaxosMsg::decode(&chosen.to_string())?, chosen);
        Ok(())
    }

    #[test]
    fn decode_errors() {
        assert!(PaxosMsg::decode("GOSSIP:1:2").is_err());
        assert!(PaxosMsg::decode("SERVER_TO_CLIENT:MAYBE").is_err());
        assert!(PaxosMsg::decode("PREPARE:1:2:3").is_err());
        assert!(PaxosMsg::decode("PREPARE:1:2:3:4:5").is_err());
        assert!(PaxosMsg::decode("HEART_BEAT:x:1").is_err());
        assert!(PaxosMsg::decode("PREPARE_RESPONSE:0:1:2:yes:1:1:v").is_err());
        assert!(PaxosMsg::decode("").is_err());
    }
}
