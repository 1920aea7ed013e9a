use std::io::{Seek, SeekFrom};

/// Length helpers for [`Seek`] streams.
pub trait StreamLen: Seek {
    /// Bytes remaining between the current position and the end of the
    /// stream. The position is restored before returning.
    fn stream_len_bp(&mut self) -> std::io::Result<u64> {
        let position = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        if position != end {
            self.seek(SeekFrom::Start(position))?;
        }
        Ok(end - position)
    }
}

impl<T: Seek> StreamLen for T {}
