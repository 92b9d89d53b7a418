/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::debug;
use std::cmp;
use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

pub const VECTORED_MAX: usize = 8;

pub fn trim_for_display(s: &str, max: usize) -> String {
    // NOTE: O(n)
    let char_len = s.chars().count();

    if char_len > max && max >= 7 {
        let dist = max / 2;
        let mut left_end = 0;
        let mut right_start = 0;

        // NOTE: O(n)
        for (i, (pos, _)) in s.char_indices().enumerate() {
            // dist guaranteed to be < char_len
            if i == dist {
                left_end = pos;
            }

            // (char_len - dist + 3) guaranteed to be < char_len
            if i == char_len - dist + 3 {
                right_start = pos;
            }
        }

        let left = &s[..left_end];
        let right = &s[right_start..];

        format!("{}...{}", left, right)
    } else {
        s.to_owned()
    }
}

#[allow(clippy::len_without_is_empty)]
pub trait RefRead {
    fn len(&self) -> usize;
    fn get_ref(&self) -> &[u8];
    fn get_mut(&mut self) -> &mut [u8];
    fn consume(&mut self, amt: usize);
}

impl RefRead for io::Cursor<&mut [u8]> {
    fn len(&self) -> usize {
        RefRead::get_ref(self).len()
    }

    fn get_ref(&self) -> &[u8] {
        let pos = self.position() as usize;

        &self.get_ref()[pos..]
    }

    fn get_mut(&mut self) -> &mut [u8] {
        let pos = self.position() as usize;

        &mut self.get_mut()[pos..]
    }

    fn consume(&mut self, amt: usize) {
        let pos = self.position();

        self.set_position(pos + (amt as u64));
    }
}

pub fn write_vectored_offset<W: Write>(
    writer: &mut W,
    bufs: &[&[u8]],
    offset: usize,
) -> Result<usize, io::Error> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut offset = offset;
    let mut start = 0;

    while offset >= bufs[start].len() {
        // on the last buf?
        if start + 1 >= bufs.len() {
            // exceeding the last buf is an error
            if offset > bufs[start].len() {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }

            return Ok(0);
        }

        offset -= bufs[start].len();
        start += 1;
    }

    let mut arr = [io::IoSlice::new(&b""[..]); VECTORED_MAX];
    let mut arr_len = 0;

    for (index, &buf) in bufs.iter().enumerate().skip(start) {
        let buf = if index == start { &buf[offset..] } else { buf };

        arr[arr_len] = io::IoSlice::new(buf);
        arr_len += 1;
    }

    writer.write_vectored(&arr[..arr_len])
}

// shared pool of fixed-size byte blocks. checkouts are scope-bound: the
// block rides back into the pool when the PooledBuf drops, on every exit
// path
pub struct BufferPool {
    block_size: usize,
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(block_size: usize, count: usize) -> Arc<Self> {
        let mut blocks = Vec::with_capacity(count);

        for _ in 0..count {
            blocks.push(vec![0; block_size]);
        }

        Arc::new(Self {
            block_size,
            blocks: Mutex::new(blocks),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn checkout(self: &Arc<Self>) -> PooledBuf {
        let data = {
            let mut blocks = self.blocks.lock().unwrap();

            blocks.pop()
        };

        let data = match data {
            Some(data) => data,
            None => {
                // pool exhausted. grow rather than block the caller
                debug!("buffer pool exhausted, allocating");

                vec![0; self.block_size]
            }
        };

        PooledBuf {
            data,
            pool: Arc::clone(self),
        }
    }

    fn put_back(&self, data: Vec<u8>) {
        let mut blocks = self.blocks.lock().unwrap();

        blocks.push(data);
    }
}

pub struct PooledBuf {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);

        self.pool.put_back(data);
    }
}

// contiguous read/write buffer over borrowed or pooled storage. readable
// bytes always form one slice; freeing space compacts toward the front
pub struct RingBuffer<T> {
    buf: T,
    start: usize,
    end: usize,
}

pub type PooledRingBuffer = RingBuffer<PooledBuf>;

impl<T: AsRef<[u8]> + AsMut<[u8]>> RingBuffer<T> {
    pub fn new(buf: T) -> Self {
        Self {
            buf,
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().len()
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    pub fn read_avail(&self) -> usize {
        self.end - self.start
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf.as_ref()[self.start..self.end]
    }

    pub fn read_buf_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);

        &mut self.buf.as_mut()[start..end]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.end);

        self.start += amount;

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn write_avail(&self) -> usize {
        self.capacity() - (self.end - self.start)
    }

    pub fn write_buf(&mut self) -> &mut [u8] {
        if self.start > 0 {
            self.align();
        }

        let end = self.end;

        &mut self.buf.as_mut()[end..]
    }

    pub fn write_commit(&mut self, amount: usize) {
        assert!(self.end + amount <= self.capacity());

        self.end += amount;
    }

    // move readable bytes to the front. returns the readable size
    pub fn align(&mut self) -> usize {
        let size = self.end - self.start;

        if self.start > 0 {
            let start = self.start;
            let end = self.end;

            self.buf.as_mut().copy_within(start..end, 0);

            self.start = 0;
            self.end = size;
        }

        size
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> RefRead for RingBuffer<T> {
    fn len(&self) -> usize {
        self.read_avail()
    }

    fn get_ref(&self) -> &[u8] {
        self.read_buf()
    }

    fn get_mut(&mut self) -> &mut [u8] {
        self.read_buf_mut()
    }

    fn consume(&mut self, amt: usize) {
        self.read_commit(amt);
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Write for RingBuffer<T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        if !buf.is_empty() && self.write_avail() == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        let dest = self.write_buf();
        let size = cmp::min(dest.len(), buf.len());

        dest[..size].copy_from_slice(&buf[..size]);

        self.write_commit(size);

        Ok(size)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_for_display() {
        assert_eq!(trim_for_display("hello", 10), "hello");

        let out = trim_for_display("hello world, hello world", 8);
        assert!(out.len() < 24);
        assert!(out.contains("..."));
    }

    #[test]
    fn test_write_vectored_offset() {
        let mut out = Vec::new();

        let size = write_vectored_offset(&mut out, &[b"hello", b" world"], 0).unwrap();
        assert_eq!(size, 11);
        assert_eq!(out, b"hello world");

        let mut out = Vec::new();

        let size = write_vectored_offset(&mut out, &[b"hello", b" world"], 7).unwrap();
        assert_eq!(size, 4);
        assert_eq!(out, b"orld");

        let mut out = Vec::new();

        let size = write_vectored_offset(&mut out, &[b"hello"], 5).unwrap();
        assert_eq!(size, 0);

        let mut out = Vec::new();

        let r = write_vectored_offset(&mut out, &[b"hello"], 6);
        assert!(r.is_err());
    }

    #[test]
    fn test_pool_checkout() {
        let pool = BufferPool::new(16, 1);

        {
            let a = pool.checkout();
            assert_eq!(a.as_ref().len(), 16);

            // pool is empty now, checkout grows
            let b = pool.checkout();
            assert_eq!(b.as_ref().len(), 16);
        }

        // both returned
        assert_eq!(pool.blocks.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_ring_buffer() {
        let pool = BufferPool::new(8, 1);
        let mut rb = RingBuffer::new(pool.checkout());

        assert_eq!(rb.capacity(), 8);
        assert_eq!(rb.write_avail(), 8);

        let size = rb.write(b"hello").unwrap();
        assert_eq!(size, 5);
        assert_eq!(rb.read_avail(), 5);
        assert_eq!(rb.read_buf(), b"hello");

        rb.read_commit(3);
        assert_eq!(rb.read_buf(), b"lo");
        assert_eq!(rb.write_avail(), 6);

        // forces an align to reclaim the consumed front
        let size = rb.write(b"worldx").unwrap();
        assert_eq!(size, 6);
        assert_eq!(rb.read_buf(), b"loworldx");

        rb.read_commit(8);
        assert_eq!(rb.read_avail(), 0);
        assert_eq!(rb.write_avail(), 8);
    }

    #[test]
    fn test_ring_buffer_ref_read() {
        let pool = BufferPool::new(8, 1);
        let mut rb = RingBuffer::new(pool.checkout());

        rb.write(b"abc").unwrap();

        assert_eq!(RefRead::len(&rb), 3);
        assert_eq!(RefRead::get_ref(&rb), b"abc");

        rb.consume(2);
        assert_eq!(RefRead::get_ref(&rb), b"c");
    }
}
