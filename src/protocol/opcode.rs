use crate::error::DriverError;

/// Operation codes of the wire messages this driver speaks.
///
/// The discriminants are the on-wire values, so the compiler rejects two
/// kinds sharing a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    GetMore = 2005,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl OpCode {
    pub const ALL: [OpCode; 6] = [
        OpCode::Reply,
        OpCode::Query,
        OpCode::GetMore,
        OpCode::KillCursors,
        OpCode::Compressed,
        OpCode::Msg,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
            OpCode::Compressed => "OP_COMPRESSED",
            OpCode::Msg => "OP_MSG",
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = DriverError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        OpCode::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or_else(|| DriverError::protocol(format!("Unknown op code {}", code)))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}
