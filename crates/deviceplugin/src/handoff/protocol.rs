use super::HandoffError;

const REQUEST_SOCKET: &str = "/xsk_fd";
const ACK: &str = "/fd_ack";
const NAK: &str = "/fd_nak";

/// Longest message either side accepts, newline included.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Asks for the socket of one allocated device.
    Socket { device: String },
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, HandoffError> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.split_once(',') {
            Some((REQUEST_SOCKET, device)) if !device.is_empty() && !device.contains(',') => {
                Ok(Self::Socket {
                    device: device.to_string(),
                })
            }
            _ => Err(HandoffError::Malformed(line.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Socket { device } => format!("{REQUEST_SOCKET},{device}\n"),
        }
    }
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The socket is attached to this message.
    Ack,
    Nak { reason: String },
}

impl Response {
    pub fn nak(reason: impl Into<String>) -> Self {
        Self::Nak {
            reason: reason.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, HandoffError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == ACK {
            return Ok(Self::Ack);
        }
        match line.split_once(',') {
            Some((NAK, reason)) => Ok(Self::nak(reason)),
            None if line == NAK => Ok(Self::nak("")),
            _ => Err(HandoffError::Malformed(line.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ack => format!("{ACK}\n"),
            // keep the reply on one line
            Self::Nak { reason } => format!("{NAK},{}\n", reason.replace(['\r', '\n'], " ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format() {
        let request = Request::Socket {
            device: "eth-pool-0".to_string(),
        };
        assert_eq!(request.encode(), "/xsk_fd,eth-pool-0\n");
        assert_eq!(Request::parse("/xsk_fd,eth-pool-0\n").unwrap(), request);
    }

    #[test]
    fn malformed_requests() {
        for line in ["", "/xsk_fd", "/xsk_fd,", "/xsk_fd,a,b", "/other,eth0", "xsk_fd,eth0"] {
            assert!(
                matches!(Request::parse(line), Err(HandoffError::Malformed(_))),
                "{line:?} parsed"
            );
        }
    }

    #[test]
    fn response_wire_format() {
        assert_eq!(Response::Ack.encode(), "/fd_ack\n");
        assert_eq!(Response::parse("/fd_ack\n").unwrap(), Response::Ack);

        let nak = Response::nak("device eth0 has no pending session");
        assert_eq!(nak.encode(), "/fd_nak,device eth0 has no pending session\n");
        assert_eq!(Response::parse(&nak.encode()).unwrap(), nak);

        assert_eq!(Response::nak("a\nb").encode(), "/fd_nak,a b\n");
        assert!(Response::parse("/fd_what").is_err());
    }
}
