//! Connection handles and their mio token mapping.
//!
//! A `ConnId` is the opaque handle the event source gives out for each
//! accepted connection. The proactor stores connections in a slab, so the id
//! is the slab key and doubles as the mio `Token` for readiness events.

use mio::Token;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Opaque handle for one raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl ConnId {
    /// Readiness token for this connection.
    pub fn token(self) -> Token {
        Token(self.0)
    }

    /// Map a readiness token back to a connection.
    ///
    /// Returns `None` for the listener token.
    pub fn from_token(token: Token) -> Option<Self> {
        if token == LISTENER_TOKEN {
            None
        } else {
            Some(ConnId(token.0))
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_skips_listener() {
        let id = ConnId(7);
        assert_eq!(id.token(), Token(7));
        assert_eq!(ConnId::from_token(Token(7)), Some(id));
        assert_eq!(ConnId::from_token(LISTENER_TOKEN), None);
        assert_eq!(id.to_string(), "conn-7");
    }
}
