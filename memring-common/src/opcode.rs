// opcode.rs - Binary protocol command opcodes
//
// Each request carries one opcode byte at offset 1 of the header; the server
// echoes it in the response. The quiet variants (GetQ, GetKQ) suppress the
// response on a miss so that a batch of them can be pipelined and terminated
// with a NoOp.

/// Get a value.
pub const OP_GET: u8 = 0x00;
/// Store unconditionally.
pub const OP_SET: u8 = 0x01;
/// Store only when the key is absent.
pub const OP_ADD: u8 = 0x02;
/// Store only when the key is present.
pub const OP_REPLACE: u8 = 0x03;
/// Remove a key.
pub const OP_DELETE: u8 = 0x04;
/// Increment a counter.
pub const OP_INCREMENT: u8 = 0x05;
/// Decrement a counter.
pub const OP_DECREMENT: u8 = 0x06;
/// Close the connection.
pub const OP_QUIT: u8 = 0x07;
/// Invalidate every item on the node.
pub const OP_FLUSH: u8 = 0x08;
/// Quiet get (no response on miss).
pub const OP_GETQ: u8 = 0x09;
/// No operation; terminates pipelines.
pub const OP_NOOP: u8 = 0x0a;
/// Server version string.
pub const OP_VERSION: u8 = 0x0b;
/// Get returning the key.
pub const OP_GETK: u8 = 0x0c;
/// Quiet get returning the key.
pub const OP_GETKQ: u8 = 0x0d;
/// Append data to an existing value.
pub const OP_APPEND: u8 = 0x0e;
/// Prepend data to an existing value.
pub const OP_PREPEND: u8 = 0x0f;
/// Statistics stream.
pub const OP_STAT: u8 = 0x10;
/// Update expiration without fetching.
pub const OP_TOUCH: u8 = 0x1c;
/// Fetch and update expiration.
pub const OP_GAT: u8 = 0x1d;
/// List SASL mechanisms.
pub const OP_SASL_LIST_MECHS: u8 = 0x20;
/// Start SASL authentication.
pub const OP_SASL_AUTH: u8 = 0x21;
/// Continue SASL authentication.
pub const OP_SASL_STEP: u8 = 0x22;

/// Protocol command opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get = OP_GET,
    Set = OP_SET,
    Add = OP_ADD,
    Replace = OP_REPLACE,
    Delete = OP_DELETE,
    Increment = OP_INCREMENT,
    Decrement = OP_DECREMENT,
    Quit = OP_QUIT,
    Flush = OP_FLUSH,
    GetQ = OP_GETQ,
    NoOp = OP_NOOP,
    Version = OP_VERSION,
    GetK = OP_GETK,
    GetKQ = OP_GETKQ,
    Append = OP_APPEND,
    Prepend = OP_PREPEND,
    Stat = OP_STAT,
    Touch = OP_TOUCH,
    GetAndTouch = OP_GAT,
    SaslListMechs = OP_SASL_LIST_MECHS,
    SaslAuth = OP_SASL_AUTH,
    SaslStep = OP_SASL_STEP,
}

impl Opcode {
    /// Convert opcode to its wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create an opcode from its wire byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            OP_GET => Some(Self::Get),
            OP_SET => Some(Self::Set),
            OP_ADD => Some(Self::Add),
            OP_REPLACE => Some(Self::Replace),
            OP_DELETE => Some(Self::Delete),
            OP_INCREMENT => Some(Self::Increment),
            OP_DECREMENT => Some(Self::Decrement),
            OP_QUIT => Some(Self::Quit),
            OP_FLUSH => Some(Self::Flush),
            OP_GETQ => Some(Self::GetQ),
            OP_NOOP => Some(Self::NoOp),
            OP_VERSION => Some(Self::Version),
            OP_GETK => Some(Self::GetK),
            OP_GETKQ => Some(Self::GetKQ),
            OP_APPEND => Some(Self::Append),
            OP_PREPEND => Some(Self::Prepend),
            OP_STAT => Some(Self::Stat),
            OP_TOUCH => Some(Self::Touch),
            OP_GAT => Some(Self::GetAndTouch),
            OP_SASL_LIST_MECHS => Some(Self::SaslListMechs),
            OP_SASL_AUTH => Some(Self::SaslAuth),
            OP_SASL_STEP => Some(Self::SaslStep),
            _ => None,
        }
    }

    /// Get human-readable command name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Replace => "REPLACE",
            Self::Delete => "DELETE",
            Self::Increment => "INCREMENT",
            Self::Decrement => "DECREMENT",
            Self::Quit => "QUIT",
            Self::Flush => "FLUSH",
            Self::GetQ => "GETQ",
            Self::NoOp => "NOOP",
            Self::Version => "VERSION",
            Self::GetK => "GETK",
            Self::GetKQ => "GETKQ",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
            Self::Stat => "STAT",
            Self::Touch => "TOUCH",
            Self::GetAndTouch => "GAT",
            Self::SaslListMechs => "SASL_LIST_MECHS",
            Self::SaslAuth => "SASL_AUTH",
            Self::SaslStep => "SASL_STEP",
        }
    }

    /// Check if the server suppresses the response on a miss
    pub const fn is_quiet(self) -> bool {
        matches!(self, Self::GetQ | Self::GetKQ)
    }

    /// Check if command modifies cached data
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::Set
                | Self::Add
                | Self::Replace
                | Self::Delete
                | Self::Increment
                | Self::Decrement
                | Self::Flush
                | Self::Append
                | Self::Prepend
                | Self::Touch
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
