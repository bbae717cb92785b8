pub(crate) const MAGIC: u8 = 0xFF;
pub(crate) const FORMAT_VERSION: u8 = 1;

pub(crate) const UNDEFINED: u8 = b'_';
pub(crate) const NULL: u8 = b'0';
pub(crate) const TRUE: u8 = b'T';
pub(crate) const FALSE: u8 = b'F';
pub(crate) const NUMBER: u8 = b'N';
pub(crate) const BIGINT: u8 = b'Z';
pub(crate) const STRING: u8 = b'S';
pub(crate) const DATE: u8 = b'D';
pub(crate) const OBJECT: u8 = b'o';
pub(crate) const ARRAY: u8 = b'A';
pub(crate) const BACKREF: u8 = b'^';
/// Copied exclusive buffer, bytes inline.
pub(crate) const ARRAY_BUFFER: u8 = b'B';
/// Index into the message's transferred buffers.
pub(crate) const TRANSFERRED_BUFFER: u8 = b't';
/// Index into the message's shared regions.
pub(crate) const SHARED_BUFFER: u8 = b'u';
/// Index into the message's moved mailboxes.
pub(crate) const PORT: u8 = b'P';
