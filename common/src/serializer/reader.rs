use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Invalid size")]
    InvalidSize,
    #[error("Invalid value")]
    InvalidValue,
    #[error("Not enough bytes: expected {expected}, got {available}")]
    NotEnoughBytes { expected: usize, available: usize },
}

pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, total: 0 }
    }

    pub fn read_bytes_ref(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.bytes.len() {
            return Err(ReaderError::NotEnoughBytes {
                expected: n,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        self.total += n;
        Ok(head)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], ReaderError> {
        let slice = self.read_bytes_ref(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        let [byte] = self.read_bytes::<1>()?;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        Ok(u16::from_be_bytes(self.read_bytes::<2>()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        Ok(u64::from_be_bytes(self.read_bytes::<8>()?))
    }

    /// Consume everything left in the buffer.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = self.bytes;
        self.total += rest.len();
        self.bytes = &[];
        rest
    }

    // Bytes left to read
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_read(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_big_endian_integers() {
        let data = [0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a, 0xff];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_u8().unwrap(), 0xff);
        assert_eq!(reader.size(), 0);
        assert_eq!(reader.total_read(), data.len());
    }

    #[test]
    fn test_read_past_end_fails() {
        let data = [0u8; 3];
        let mut reader = Reader::new(&data);
        assert_eq!(
            reader.read_u64(),
            Err(ReaderError::NotEnoughBytes {
                expected: 8,
                available: 3
            })
        );
        // A failed read does not consume anything
        assert_eq!(reader.size(), 3);
    }
}
