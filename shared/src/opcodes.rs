//! Protocol identifiers, opcodes and error codes.
//!
//! The first byte of a connection's first message selects the protocol on a
//! shared port; every later message starts with an opcode byte.

use thiserror::Error;

/// Version both sides must agree on before any session starts.
pub const PROTOCOL_VERSION: u16 = 1;

/// Declares a `u8` backed enum with a checked conversion from the wire byte.
macro_rules! byte_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }
    };
}

byte_enum! {
    /// Identifier byte that routes a first message to its protocol.
    pub enum ProtocolId {
        Login = 0x01,
        Game = 0x0A,
        Admin = 0xFE,
        Status = 0xFF,
    }
}

byte_enum! {
    /// Login protocol, client to server.
    pub enum LoginRequest {
        Login = 0x01,
        CreateAccount = 0x02,
    }
}

byte_enum! {
    /// Login protocol, server to client.
    pub enum LoginReply {
        Error = 0x0A,
        CharacterList = 0x64,
        AccountCreated = 0x65,
    }
}

byte_enum! {
    /// Game protocol, client to server. Only valid once encryption is on.
    pub enum GameRequest {
        Logout = 0x14,
        Ping = 0x1E,
        Move = 0x64,
        Chat = 0x96,
    }
}

byte_enum! {
    /// Game protocol, server to client.
    pub enum GameReply {
        KeyExchange = 0x01,
        EnterWorld = 0x0A,
        Error = 0x14,
        Pong = 0x1E,
        PlayerJoined = 0x6A,
        PlayerLeft = 0x6C,
        PlayerMoved = 0x6D,
        ChatMessage = 0xAA,
        ServerMessage = 0xB4,
    }
}

byte_enum! {
    /// Admin protocol commands.
    pub enum AdminRequest {
        Ping = 0x01,
        Broadcast = 0x02,
        Kick = 0x03,
        BanIp = 0x04,
        UnbanIp = 0x05,
        ServerInfo = 0x06,
        Shutdown = 0x07,
    }
}

byte_enum! {
    /// Admin protocol replies.
    pub enum AdminReply {
        Accepted = 0x10,
        Error = 0x11,
        Ok = 0x12,
        Pong = 0x13,
        ServerInfo = 0x14,
    }
}

byte_enum! {
    /// Status protocol requests. The reply reuses the request byte.
    pub enum StatusRequest {
        Info = 0x01,
        PlayerList = 0x02,
    }
}

byte_enum! {
    /// Reason codes carried in error replies.
    #[derive(Error)]
    pub enum ErrorCode {
        #[error("wrong protocol version")]
        WrongProtocolVersion = 0x01,
        #[error("your IP address is banned")]
        IpBanned = 0x02,
        #[error("too many connections from this IP")]
        TooManyConnectionsFromThisIP = 0x03,
        #[error("invalid account name or password")]
        InvalidCredentials = 0x04,
        #[error("account is banned")]
        AccountBanned = 0x05,
        #[error("account already exists")]
        AccountExists = 0x06,
        #[error("invalid account name or password format")]
        InvalidAccountData = 0x07,
        #[error("session token is invalid or expired")]
        InvalidToken = 0x08,
        #[error("server is full")]
        ServerFull = 0x09,
        #[error("character not found")]
        CharacterNotFound = 0x0A,
        #[error("character is already online")]
        AlreadyOnline = 0x0B,
        #[error("not authorized")]
        NotAuthorized = 0x0C,
        #[error("invalid key exchange")]
        InvalidKey = 0x0D,
        #[error("malformed request")]
        MalformedRequest = 0x0E,
        #[error("unknown error")]
        Unknown = 0xFF,
    }
}

impl ErrorCode {
    /// Decodes a wire byte, mapping unrecognised values to [`ErrorCode::Unknown`].
    pub fn from_wire(value: u8) -> Self {
        Self::from_u8(value).unwrap_or(Self::Unknown)
    }
}
