//! シーク可能なバイトストアのインタフェース定義と実装群.
//!
//! このモジュールは[ClusterStorage](../storage/struct.ClusterStorage.html)が
//! レコードの読み書きに使用するボックスファイルを提供する.
use std::io::{Read, Seek, SeekFrom, Write};

pub use self::builder::StorageFileBuilder;
pub use self::divided::{existing_numbered_paths, numbered_path, DividedFile};
pub use self::single::SingleFile;

use crate::{ErrorKind, Result};

mod builder;
mod divided;
mod single;

/// シーク可能で、末尾位置の変更が可能なバイトストアを表すトレイト.
///
/// 読み書きの位置やサイズにアライメントの制約はなく、
/// 容量も固定されていない(書き込みに応じて伸長する).
///
/// `read`は、ストアの末尾に達した場合には`0`を返す.
pub trait StorageFile: Read + Write + Seek {
    /// 読み書き用カーソルの現在位置を返す.
    fn position(&self) -> u64;

    /// ストアの現在のサイズ(バイト単位)を返す.
    fn size(&mut self) -> Result<u64>;

    /// カーソルの現在位置をストアの末尾とする.
    ///
    /// 現在のサイズよりも後方が指定されている場合には、ストアは伸長される.
    fn set_end_of_file(&mut self) -> Result<()>;

    /// 書き込まれた内容を、物理デバイスに同期する.
    fn sync(&mut self) -> Result<()>;

    /// `SeekFrom`形式で指定された位置を、開始地点からのオフセットに変換する.
    ///
    /// # Errors
    ///
    /// 変換後の位置が`0`未満の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    fn convert_to_offset(&mut self, pos: SeekFrom) -> Result<u64> {
        match pos {
            SeekFrom::Start(offset) => Ok(offset),
            SeekFrom::End(delta) => {
                let offset = track!(self.size())? as i64 + delta;
                track_assert!(0 <= offset, ErrorKind::InvalidInput);
                Ok(offset as u64)
            }
            SeekFrom::Current(delta) => {
                let offset = self.position() as i64 + delta;
                track_assert!(0 <= offset, ErrorKind::InvalidInput);
                Ok(offset as u64)
            }
        }
    }

    /// ストアのサイズが`len`未満であれば、`len`まで伸長する.
    ///
    /// 伸長が行われた場合には`true`が返される.
    fn ensure_len(&mut self, len: u64) -> Result<bool> {
        let size = track!(self.size())?;
        if size >= len {
            return Ok(false);
        }
        track_io!(self.seek(SeekFrom::Start(len)))?;
        track!(self.set_end_of_file())?;
        Ok(true)
    }

    /// `offset`の位置から`buf`を埋めるだけのバイト列を読み込む.
    ///
    /// 途中で末尾に達した場合(短い読み込み)はエラーとなる.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        track_io!(self.read_exact(buf))?;
        Ok(())
    }

    /// `offset`の位置から`bufs`の内容を連続して書き込む.
    fn write_all_at(&mut self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        track_io!(self.seek(SeekFrom::Start(offset)))?;
        for buf in bufs {
            track_io!(self.write_all(buf))?;
        }
        track_io!(self.flush())?;
        Ok(())
    }
}
