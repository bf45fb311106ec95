//! 固定长度的消息缓冲区。
//!
//! - 发送与接收都以“整块所有权移交”的方式进行：提交操作时缓冲区被移入请求，
//!   直到请求退役后才通过 `take_buffer` 交还调用方，挂起期间任何人都无法读写它；
//! - 底层使用 `BytesMut`，长度在创建后保持不变。

use core::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};

/// 长度固定的可写字节区域。
#[derive(Clone, PartialEq, Eq)]
pub struct MessageBuffer {
    bytes: BytesMut,
}

impl MessageBuffer {
    /// 创建 `len` 字节、内容全零的缓冲区。
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: BytesMut::zeroed(len),
        }
    }

    /// 以给定内容创建缓冲区，长度等于 `data.len()`。
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            bytes: BytesMut::from(data),
        }
    }

    /// 缓冲区长度。
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 是否为零长度缓冲区。
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 拷贝出一份不可变载荷，供后端放上“线路”。
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes)
    }

    /// 将 `payload` 写入缓冲区前缀，返回实际写入的字节数。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：写入 `min(payload.len(), self.len())` 字节，缓冲区长度不变；
    ///   返回值小于 `payload.len()` 即表示发生截断；
    /// - **风险 (Trade-offs)**：截断时尾部数据被丢弃，调用方需通过完成信息中的 `truncated` 标志感知。
    pub fn fill_prefix(&mut self, payload: &[u8]) -> usize {
        let n = payload.len().min(self.bytes.len());
        self.bytes[..n].copy_from_slice(&payload[..n]);
        n
    }
}

impl Deref for MessageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MessageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl From<Vec<u8>> for MessageBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self {
            bytes: BytesMut::from(&value[..]),
        }
    }
}

impl core::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_prefix_truncates_to_capacity() {
        let mut buffer = MessageBuffer::zeroed(4);
        let written = buffer.fill_prefix(b"abcdef");
        assert_eq!(written, 4);
        assert_eq!(&buffer[..], b"abcd");

        let written = buffer.fill_prefix(b"xy");
        assert_eq!(written, 2);
        assert_eq!(&buffer[..], b"xycd", "短载荷只覆盖前缀");
    }
}
