//! 引擎地址：一段不透明字节，由后端生成、经地址交换服务发布，再由对端用于建连。

use bytes::Bytes;

/// 后端工作引擎的不透明地址。
///
/// 内容只对生成它的后端有意义，上层仅负责搬运与缓存。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerAddress(Bytes);

impl WorkerAddress {
    /// 以字节内容构造地址。
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// 地址字节。
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 交出底层 `Bytes`，用于发布到地址交换服务。
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<Bytes> for WorkerAddress {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}
