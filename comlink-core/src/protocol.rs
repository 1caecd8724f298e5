//! Opcodes for link frames and routed envelopes.
//!
//! A link opcode byte carries its category in the upper four bits and the subtype in the
//! lower four.

/// Version byte exchanged in the transport hello.
pub const PROTOCOL_VERSION: u8 = 1;

pub const CATEGORY_MASK: u8 = 0xF0;
pub const SUBTYPE_MASK: u8 = 0x0F;

/// Upper nibble of a link opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    Request = 0x00,
    Send = 0x10,
    Command = 0x20,
}

// Request / Send subtypes.
pub const DEGREE: u8 = 0x0;
pub const FILE_EMPTY: u8 = 0x1;
pub const FILE_WHOLE: u8 = 0x2;
pub const FILE_PART: u8 = 0x3;
pub const FILE: u8 = 0x4;
pub const LIGHT: u8 = 0x5;

// Command subtypes.
pub const CLOSE: u8 = 0x0;
pub const CLOSE_ACK: u8 = 0x1;
pub const CLOSE_DECLINE: u8 = 0x2;

/// Opcode byte that matches no known frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown opcode {0:#04x}")]
pub struct UnknownOpcode(pub u8);

/// Every frame a link can send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    RequestDegree,
    RequestLight,
    RequestFile,
    SendDegree,
    SendLight,
    SendFileEmpty,
    SendFileWhole,
    SendFilePart,
    Close,
    CloseAck,
    CloseDecline,
}

impl Opcode {
    pub fn category(self) -> Category {
        match self {
            Opcode::RequestDegree | Opcode::RequestLight | Opcode::RequestFile => Category::Request,
            Opcode::SendDegree
            | Opcode::SendLight
            | Opcode::SendFileEmpty
            | Opcode::SendFileWhole
            | Opcode::SendFilePart => Category::Send,
            Opcode::Close | Opcode::CloseAck | Opcode::CloseDecline => Category::Command,
        }
    }

    pub fn subtype(self) -> u8 {
        match self {
            Opcode::RequestDegree | Opcode::SendDegree => DEGREE,
            Opcode::RequestLight | Opcode::SendLight => LIGHT,
            Opcode::RequestFile => FILE,
            Opcode::SendFileEmpty => FILE_EMPTY,
            Opcode::SendFileWhole => FILE_WHOLE,
            Opcode::SendFilePart => FILE_PART,
            Opcode::Close => CLOSE,
            Opcode::CloseAck => CLOSE_ACK,
            Opcode::CloseDecline => CLOSE_DECLINE,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.category() as u8 | self.subtype()
    }

    pub fn from_byte(b: u8) -> Result<Self, UnknownOpcode> {
        let op = match (b & CATEGORY_MASK, b & SUBTYPE_MASK) {
            (0x00, DEGREE) => Opcode::RequestDegree,
            (0x00, LIGHT) => Opcode::RequestLight,
            (0x00, FILE) => Opcode::RequestFile,
            (0x10, DEGREE) => Opcode::SendDegree,
            (0x10, LIGHT) => Opcode::SendLight,
            (0x10, FILE_EMPTY) => Opcode::SendFileEmpty,
            (0x10, FILE_WHOLE) => Opcode::SendFileWhole,
            (0x10, FILE_PART) => Opcode::SendFilePart,
            (0x20, CLOSE) => Opcode::Close,
            (0x20, CLOSE_ACK) => Opcode::CloseAck,
            (0x20, CLOSE_DECLINE) => Opcode::CloseDecline,
            _ => return Err(UnknownOpcode(b)),
        };
        Ok(op)
    }
}

/// Close handshake commands an application may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Close,
    CloseAck,
    CloseDecline,
}

impl Command {
    pub fn opcode(self) -> Opcode {
        match self {
            Command::Close => Opcode::Close,
            Command::CloseAck => Opcode::CloseAck,
            Command::CloseDecline => Opcode::CloseDecline,
        }
    }
}

/// A link frame held in memory.
///
/// File payloads are carried inline here; the receive path streams them to disk instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    RequestDegree,
    RequestLight,
    RequestFile { name: String },
    Degree(f32),
    Light(f32),
    FileEmpty,
    FileWhole { name: String, data: Vec<u8> },
    FilePart { total_parts: i32, name: String, data: Vec<u8> },
    Command(Command),
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::RequestDegree => Opcode::RequestDegree,
            Frame::RequestLight => Opcode::RequestLight,
            Frame::RequestFile { .. } => Opcode::RequestFile,
            Frame::Degree(_) => Opcode::SendDegree,
            Frame::Light(_) => Opcode::SendLight,
            Frame::FileEmpty => Opcode::SendFileEmpty,
            Frame::FileWhole { .. } => Opcode::SendFileWhole,
            Frame::FilePart { .. } => Opcode::SendFilePart,
            Frame::Command(c) => c.opcode(),
        }
    }
}

// Routed envelope categories (upper nibble of the routed code byte).
pub const ROUTE_DATA: u8 = 0x00;
pub const ROUTE_VIRTUAL_ADMIN: u8 = 0x10;
pub const ROUTE_COMMAND: u8 = 0x20;

/// Code byte of a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteCode {
    /// Carries a link frame for the addressed peer.
    Data,
    ConnectRequest,
    ConnectAck,
    ConnectDecline,
    ReceiverNotKnown,
    /// Ends the physical link between a device and the relay.
    ClosePhysical,
    ClosePhysicalAck,
    ClosePhysicalDecline,
}

impl RouteCode {
    pub fn to_byte(self) -> u8 {
        match self {
            RouteCode::Data => ROUTE_DATA,
            RouteCode::ConnectRequest => ROUTE_VIRTUAL_ADMIN,
            RouteCode::ConnectAck => ROUTE_VIRTUAL_ADMIN | 1,
            RouteCode::ConnectDecline => ROUTE_VIRTUAL_ADMIN | 2,
            RouteCode::ReceiverNotKnown => ROUTE_VIRTUAL_ADMIN | 3,
            RouteCode::ClosePhysical => ROUTE_COMMAND | 5,
            RouteCode::ClosePhysicalAck => ROUTE_COMMAND | 6,
            RouteCode::ClosePhysicalDecline => ROUTE_COMMAND | 7,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, UnknownOpcode> {
        let code = match b {
            0x00 => RouteCode::Data,
            0x10 => RouteCode::ConnectRequest,
            0x11 => RouteCode::ConnectAck,
            0x12 => RouteCode::ConnectDecline,
            0x13 => RouteCode::ReceiverNotKnown,
            0x25 => RouteCode::ClosePhysical,
            0x26 => RouteCode::ClosePhysicalAck,
            0x27 => RouteCode::ClosePhysicalDecline,
            _ => return Err(UnknownOpcode(b)),
        };
        Ok(code)
    }

    /// Admin codes negotiate virtual connections through the relay.
    pub fn is_admin(self) -> bool {
        self.to_byte() & CATEGORY_MASK == ROUTE_VIRTUAL_ADMIN
    }

    pub fn is_physical_command(self) -> bool {
        self.to_byte() & CATEGORY_MASK == ROUTE_COMMAND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes() {
        assert_eq!(Opcode::RequestDegree.to_byte(), 0x00);
        assert_eq!(Opcode::RequestFile.to_byte(), 0x04);
        assert_eq!(Opcode::RequestLight.to_byte(), 0x05);
        assert_eq!(Opcode::SendDegree.to_byte(), 0x10);
        assert_eq!(Opcode::SendFileEmpty.to_byte(), 0x11);
        assert_eq!(Opcode::SendFileWhole.to_byte(), 0x12);
        assert_eq!(Opcode::SendFilePart.to_byte(), 0x13);
        assert_eq!(Opcode::SendLight.to_byte(), 0x15);
        assert_eq!(Opcode::Close.to_byte(), 0x20);
        assert_eq!(Opcode::CloseAck.to_byte(), 0x21);
        assert_eq!(Opcode::CloseDecline.to_byte(), 0x22);
    }

    #[test]
    fn every_opcode_parses_back() {
        for b in 0..=u8::MAX {
            if let Ok(op) = Opcode::from_byte(b) {
                assert_eq!(op.to_byte(), b);
            }
        }
    }

    #[test]
    fn unsupported_combinations_are_unknown() {
        // Requesting a whole file part makes no sense.
        assert_eq!(Opcode::from_byte(0x02), Err(UnknownOpcode(0x02)));
        assert_eq!(Opcode::from_byte(0x14), Err(UnknownOpcode(0x14)));
        assert_eq!(Opcode::from_byte(0x30), Err(UnknownOpcode(0x30)));
    }

    #[test]
    fn route_codes() {
        assert_eq!(RouteCode::ConnectRequest.to_byte(), 0x10);
        assert_eq!(RouteCode::ReceiverNotKnown.to_byte(), 0x13);
        assert_eq!(RouteCode::ClosePhysicalDecline.to_byte(), 0x27);
        assert!(RouteCode::ConnectAck.is_admin());
        assert!(!RouteCode::Data.is_admin());
        assert!(RouteCode::ClosePhysical.is_physical_command());
        assert_eq!(RouteCode::from_byte(0x26), Ok(RouteCode::ClosePhysicalAck));
        assert!(RouteCode::from_byte(0x14).is_err());
    }
}
