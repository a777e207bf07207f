//! Minimal big-endian byte serializer.
//!
//! `Reader` walks a borrowed buffer, `Writer` appends to an owned one, and
//! `Serializer` ties both together for fixed-layout wire types.

mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

pub trait Serializer: Sized {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn write(&self, writer: &mut Writer);

    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size());
        let mut writer = Writer::new(&mut buffer);
        self.write(&mut writer);
        buffer
    }

    // Trailing bytes are rejected
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::InvalidSize);
        }
        Ok(value)
    }
}
