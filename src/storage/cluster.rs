//! クラスタ(割当の最小単位)関連の構成要素.
use crate::{ErrorKind, Result};

/// [`ClusterStorage`]のクラスタサイズを表現するための構造体.
///
/// "クラスタ"は割当の最小単位であり、全てのレコードはクラスタ境界から始まり、
/// その長さはクラスタサイズの倍数に切り上げられて管理される.
///
/// クラスタサイズはストレージの生成時に固定され、以後変更してはならない.
///
/// [`ClusterStorage`]: ./struct.ClusterStorage.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterSize(u32);
impl ClusterSize {
    /// デフォルトのクラスタサイズ(バイト単位).
    pub const DEFAULT: u32 = 128;

    /// 指定された値のクラスタサイズを表現する`ClusterSize`インスタンスを生成する.
    ///
    /// # Errors
    ///
    /// `cluster_size`が`0`の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// # Examples
    ///
    /// ```
    /// use clusterstore::ErrorKind;
    /// use clusterstore::storage::ClusterSize;
    ///
    /// assert_eq!(ClusterSize::new(512).ok().map(|c| c.as_u32()), Some(512));
    /// assert_eq!(ClusterSize::new(0).err().map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
    /// ```
    pub fn new(cluster_size: u32) -> Result<Self> {
        track_assert_ne!(cluster_size, 0, ErrorKind::InvalidInput);
        Ok(ClusterSize(cluster_size))
    }

    /// クラスタサイズの値を返す.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// `len`バイトのデータをカバーするのに必要なクラスタ数を返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use clusterstore::storage::ClusterSize;
    ///
    /// let cluster_size = ClusterSize::default();
    /// assert_eq!(cluster_size.clusters(0), 0);
    /// assert_eq!(cluster_size.clusters(1), 1);
    /// assert_eq!(cluster_size.clusters(128), 1);
    /// assert_eq!(cluster_size.clusters(129), 2);
    /// ```
    pub fn clusters(self, len: u64) -> u64 {
        let size = u64::from(self.0);
        len / size + if len % size == 0 { 0 } else { 1 }
    }

    /// 指定位置より後方の最初のクラスタ境界を返す.
    pub fn ceil_align(self, position: u64) -> u64 {
        self.to_bytes(self.clusters(position))
    }

    /// 指定位置がクラスタ境界に揃っているかどうかを判定する.
    pub fn is_aligned(self, position: u64) -> bool {
        position % u64::from(self.0) == 0
    }

    /// クラスタ単位の値をバイト単位に変換する.
    pub fn to_bytes(self, clusters: u64) -> u64 {
        clusters * u64::from(self.0)
    }
}
impl Default for ClusterSize {
    fn default() -> Self {
        ClusterSize(Self::DEFAULT)
    }
}

/// 利用者が管理するレコードの位置と長さ(いずれもバイト単位).
///
/// `offset`は`ClusterStorage::save`が返した値である必要がある.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordRange {
    /// レコードの開始位置.
    pub offset: u64,

    /// レコードの長さ.
    pub length: u64,
}
impl RecordRange {
    /// 新しい`RecordRange`インスタンスを生成する.
    pub fn new(offset: u64, length: u64) -> Self {
        RecordRange { offset, length }
    }

    /// レコードの終端位置を返す.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}
