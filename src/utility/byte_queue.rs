use std::collections::LinkedList;
use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;

/// A queue of bytes that buffers in-flight stream data between simulated
/// writes and reads.
///
/// Data is stored as a linked list of chunks. Pushing copies from any
/// [`Read`] source into pre-sized chunks; popping writes as much as the
/// destination accepts and leaves the remainder queued.
pub struct ByteQueue {
    /// The queued bytes.
    chunks: LinkedList<BytesMut>,
    /// A pre-allocated buffer that can be used for new bytes.
    unused_buffer: Option<BytesMut>,
    /// The number of bytes in the queue.
    length: usize,
    /// The size of newly allocated chunks.
    default_chunk_capacity: usize,
    #[cfg(test)]
    /// An allocation counter for testing purposes.
    total_allocations: u64,
}

impl ByteQueue {
    pub fn new(default_chunk_capacity: usize) -> Self {
        assert_ne!(default_chunk_capacity, 0);
        Self {
            chunks: LinkedList::new(),
            unused_buffer: None,
            length: 0,
            default_chunk_capacity,
            #[cfg(test)]
            total_allocations: 0,
        }
    }

    /// The number of bytes in the queue.
    pub fn num_bytes(&self) -> usize {
        self.length
    }

    /// Returns true if the queue holds any bytes.
    pub fn has_bytes(&self) -> bool {
        self.length > 0
    }

    #[must_use]
    fn alloc_zeroed_buffer(&mut self, size: usize) -> BytesMut {
        #[cfg(test)]
        {
            self.total_allocations += 1;
        }

        BytesMut::zeroed(size)
    }

    /// Push bytes onto the queue, draining `src` until it reports
    /// end-of-input. Returns the number of bytes queued.
    pub fn push<R: Read>(&mut self, mut src: R) -> std::io::Result<usize> {
        let mut total_copied = 0;

        loop {
            let mut unused = match self.unused_buffer.take() {
                // we already have an allocated buffer
                Some(x) => x,
                // we need to allocate a new buffer
                None => self.alloc_zeroed_buffer(self.default_chunk_capacity),
            };
            assert_eq!(unused.len(), unused.capacity());

            let copied = match src.read(&mut unused) {
                Ok(x) => x,
                // may have been interrupted due to a signal, so try again
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    self.unused_buffer = Some(unused);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock && total_copied > 0 => {
                    self.unused_buffer = Some(unused);
                    break;
                }
                Err(e) => return Err(e),
            };
            let bytes = unused.split_to(copied);

            total_copied += bytes.len();

            if !unused.is_empty() {
                // restore the remaining unused buffer
                self.unused_buffer = Some(unused);
            }

            if bytes.is_empty() {
                break;
            }

            self.length += bytes.len();
            self.chunks.push_back(bytes);
        }

        Ok(total_copied)
    }

    /// Pop bytes from the queue into `dst`, stopping when the queue empties
    /// or `dst` stops accepting bytes. Returns the number of bytes copied.
    pub fn pop<W: Write>(&mut self, mut dst: W) -> std::io::Result<usize> {
        let mut total_copied = 0;

        loop {
            let bytes = match self.chunks.front_mut() {
                Some(x) => x,
                None => break,
            };

            let copied = match dst.write(bytes.as_ref()) {
                Ok(x) => x,
                // may have been interrupted due to a signal, so try again
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // only return an error if no bytes have been copied yet
                    if total_copied == 0 {
                        return Err(e);
                    }
                    // no bytes could be written this iteration
                    0
                }
                // a partial write may have occurred in previous iterations
                Err(e) => return Err(e),
            };

            let _ = bytes.split_to(copied);

            if copied == 0 {
                break;
            }

            self.length -= copied;
            total_copied += copied;

            if bytes.is_empty() {
                self.chunks.pop_front();
            }
        }

        Ok(total_copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let mut q = ByteQueue::new(5);
        let src: Vec<u8> = (0..=59).collect();

        let pushed = q.push(&src[..]).unwrap();
        assert_eq!(pushed, 60);
        assert_eq!(q.num_bytes(), 60);
        assert!(q.has_bytes());

        let mut dst = vec![];
        let popped = q.pop(&mut dst).unwrap();
        assert_eq!(popped, 60);
        assert_eq!(dst, src);
        assert!(!q.has_bytes());
    }

    #[test]
    fn test_partial_pop() {
        let mut q = ByteQueue::new(8);
        q.push(&[1u8, 2, 3, 4, 5, 6][..]).unwrap();

        let mut small = [0u8; 4];
        let popped = q.pop(&mut small[..]).unwrap();
        assert_eq!(popped, 4);
        assert_eq!(small, [1, 2, 3, 4]);
        assert_eq!(q.num_bytes(), 2);

        let mut rest = vec![];
        assert_eq!(q.pop(&mut rest).unwrap(), 2);
        assert_eq!(rest, vec![5, 6]);
    }

    #[test]
    fn test_bounded_source() {
        use std::io::Read;
        let mut q = ByteQueue::new(16);
        let src = [9u8; 100];
        // a Take limits how much a push may consume
        let pushed = q.push(Read::take(&src[..], 10)).unwrap();
        assert_eq!(pushed, 10);
        assert_eq!(q.num_bytes(), 10);
    }

    #[test]
    fn test_unused_buffer_reuse() {
        let mut q = ByteQueue::new(10);
        q.push(&[0u8; 3][..]).unwrap();
        q.push(&[0u8; 3][..]).unwrap();
        q.push(&[0u8; 3][..]).unwrap();
        // three small pushes fit within one allocated chunk plus its
        // end-of-input probe allocation
        assert!(q.total_allocations <= 2);
        assert_eq!(q.num_bytes(), 9);
    }
}
