/// Architectural error codes of the TCU.
///
/// These are not host errors: they are data, written into the error field of
/// the command register that triggered the operation, and carried in NoC
/// response packets. The encoding fits the 4-bit error field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Error {
    None = 0,
    MissCredits = 1,
    NoRingSpace = 2,
    InvEp = 3,
    Abort = 4,
    Pagefault = 5,
    NoPerm = 6,
    InvMsg = 7,
    OutOfBounds = 8,
    RecvGone = 9,
    ForeignEp = 10,
    SendReply = 11,
    NoMep = 12,
    UnknownCmd = 13,
}

impl Error {
    pub fn from_bits(bits: u64) -> Error {
        match bits {
            0 => Error::None,
            1 => Error::MissCredits,
            2 => Error::NoRingSpace,
            3 => Error::InvEp,
            4 => Error::Abort,
            5 => Error::Pagefault,
            6 => Error::NoPerm,
            7 => Error::InvMsg,
            8 => Error::OutOfBounds,
            9 => Error::RecvGone,
            10 => Error::ForeignEp,
            11 => Error::SendReply,
            12 => Error::NoMep,
            _ => Error::UnknownCmd,
        }
    }

    pub fn bits(self) -> u64 {
        self as u64
    }
}
