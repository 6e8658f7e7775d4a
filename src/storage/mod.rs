//! レコード用のストレージ.
//!
//! [ClusterStorage]は、可変長のレコード群を、一つのボックスファイル(論理的なバイト列)に多重化して格納する.
//! ボックスファイルは、単一の物理ファイルか、固定長の複数の物理ファイルに分割されたものとなる.
//!
//! ボックスファイル内の領域は、クラスタ単位で管理される.
//! 各クラスタの使用状況は、一クラスタを一ビットで表現したビットマップとしてマップファイルに保存される.
//!
//! レコードの中身やレコード同士の関係は、このモジュールの関知するところではなく、
//! 利用者が`save`で返されたオフセットと、レコードの長さを管理する必要がある.
//!
//! # 永続性
//!
//! - 割当(`save`)は、即座にメモリ上のマップに反映される
//! - 解放(`free`等)もメモリ上のマップには即座に反映され、その領域は以後の割当で再利用され得る
//! - ただし、マップファイルが更新されるのは`flush`(ないし`close`,`rename`)の時点のみ
//!
//! そのため`flush`を呼ばずにプロセスが終了した場合には、
//! 最後の`flush`以降の解放は無かったものとして扱われる.
//!
//! [ClusterStorage]: ./struct.ClusterStorage.html
use slog::Logger;
use std::cmp;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub use self::builder::StorageBuilder;
pub use self::cluster::{ClusterSize, RecordRange};
pub use self::paths::StoragePaths;

use self::allocator::{Allocation, FreeMap};
use crate::file::{DividedFile, SingleFile, StorageFile, StorageFileBuilder};
use crate::metrics::StorageMetrics;
use crate::{ErrorKind, Result};

pub mod allocator;

mod builder;
mod cluster;
mod map_file;
mod paths;

/// ボックスファイルの物理的な構成.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoxLayout {
    /// 単一の物理ファイル.
    Single,

    /// `block_size`バイト毎に分割された、番号付きの複数の物理ファイル.
    Divided {
        /// 物理ファイル一つ当たりのサイズ.
        block_size: u64,
    },
}
impl BoxLayout {
    /// 分割構成かどうかを返す.
    pub fn is_divided(self) -> bool {
        if let BoxLayout::Divided { .. } = self {
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
enum BoxFile {
    Single(SingleFile),
    Divided(DividedFile),
}
impl BoxFile {
    fn as_storage_file(&mut self) -> &mut dyn StorageFile {
        match self {
            BoxFile::Single(f) => f,
            BoxFile::Divided(f) => f,
        }
    }
}

/// レコードを格納するためのストレージ.
///
/// 構築には[StorageBuilder]を使用する.
///
/// 全ての操作は同期的に実行される.
/// 内部で排他制御は行わないので、複数スレッドから使用する場合には、利用者側で直列化する必要がある.
///
/// インスタンスの破棄時に、マップファイルへの書き出しが自動で行われることはない.
/// 変更を永続化したい場合には、明示的に`flush`ないし`close`を呼び出す必要がある.
///
/// [StorageBuilder]: ./struct.StorageBuilder.html
#[derive(Debug)]
pub struct ClusterStorage {
    paths: StoragePaths,
    layout: BoxLayout,
    cluster_size: ClusterSize,
    file_builder: StorageFileBuilder,
    file: Option<BoxFile>,
    map: FreeMap,
    base_logger: Logger,
    logger: Logger,
    metrics: StorageMetrics,
}
impl ClusterStorage {
    pub(crate) fn new(
        paths: StoragePaths,
        layout: BoxLayout,
        cluster_size: ClusterSize,
        file_builder: StorageFileBuilder,
        map: FreeMap,
        base_logger: Logger,
        metrics: StorageMetrics,
    ) -> Self {
        let logger = storage_logger(&base_logger, &paths);
        let storage = ClusterStorage {
            paths,
            layout,
            cluster_size,
            file_builder,
            file: None,
            map,
            base_logger,
            logger,
            metrics,
        };
        storage.update_usage();
        storage
    }

    /// デフォルト設定で、`dir`ディレクトリ内の`name`という名前のストレージを開く.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        track!(StorageBuilder::new().open(dir, name))
    }

    /// ストレージのクラスタサイズを返す.
    pub fn cluster_size(&self) -> ClusterSize {
        self.cluster_size
    }

    /// ボックスファイルの構成を返す.
    pub fn layout(&self) -> BoxLayout {
        self.layout
    }

    /// ストレージを構成するファイル群のパスを返す.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// ストレージのメトリクスを返す.
    pub fn metrics(&self) -> &StorageMetrics {
        &self.metrics
    }

    /// 割当済みのクラスタ数を返す.
    pub fn allocated_clusters(&self) -> u64 {
        self.map.working().count_set()
    }

    /// まだマップファイルに書き出されていない変更が存在するかどうかを返す.
    pub fn is_dirty(&self) -> bool {
        self.map.is_dirty()
    }

    /// 指定範囲が割当済みかどうかを返す.
    pub fn is_allocated(&self, offset: u64, length: u64) -> Result<bool> {
        let (start, count) = track!(self.cluster_range(offset, length))?;
        Ok(self.map.is_allocated(start, count))
    }

    /// 指定範囲が、マップファイル上で割当済みとなっているかどうかを返す.
    ///
    /// `free`で解放された範囲は、次の`flush`まではマップファイル上では割当済みのままとなる.
    pub fn is_durably_allocated(&self, offset: u64, length: u64) -> Result<bool> {
        let (start, count) = track!(self.cluster_range(offset, length))?;
        Ok(self.map.is_durably_allocated(start, count))
    }

    /// ボックスファイルの現在のサイズを返す.
    pub fn box_size(&mut self) -> Result<u64> {
        track!(self.file().and_then(|f| f.size()))
    }

    /// `bufs`を連結したものを一つのレコードとして保存する.
    ///
    /// 結果として、レコードの開始位置(バイト単位のオフセット)が返される.
    /// 以後、このレコードにアクセスする際には、このオフセットと`bufs`の合計長を指定する.
    ///
    /// # Errors
    ///
    /// 合計長が`0`の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// ボックスファイルの伸長に失敗した場合には、種類が`ErrorKind::StorageFull`(ないし`ErrorKind::Other`)の
    /// エラーが返される.
    ///
    /// いずれの場合でも、エラー時には割当は取り消されている.
    ///
    /// # Examples
    ///
    /// ```
    /// # extern crate clusterstore;
    /// # extern crate tempdir;
    /// # extern crate trackable;
    /// use clusterstore::storage::ClusterStorage;
    /// use tempdir::TempDir;
    /// use trackable::result::TestResult;
    ///
    /// # fn main() -> TestResult {
    /// let dir = TempDir::new("clusterstore_doc").unwrap();
    /// let mut storage = ClusterStorage::open(dir.path(), "inbox")?;
    ///
    /// let offset = storage.save(&[b"header:", b"body"])?;
    /// let mut buf = [0; 11];
    /// storage.load(&mut buf, offset)?;
    /// assert_eq!(&buf, b"header:body");
    ///
    /// storage.free(offset, 11)?;
    /// storage.close()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn save(&mut self, bufs: &[&[u8]]) -> Result<u64> {
        let length = bufs.iter().map(|b| b.len() as u64).sum::<u64>();
        track_assert_ne!(length, 0, ErrorKind::InvalidInput);

        let count = self.cluster_size.clusters(length);
        let allocation = self.map.allocate(count);
        let (allocation, previous_box_size) = track!(self.ensure_box_covers(allocation))?;
        let offset = self.cluster_size.to_bytes(allocation.start());
        if let Err(e) = self.file().and_then(|f| f.write_all_at(offset, bufs)) {
            self.rollback(&allocation, previous_box_size);
            return Err(track!(e; offset, length));
        }
        self.metrics.count_save(length);
        Ok(offset)
    }

    /// `offset`の位置にあるレコードを、`buf`を埋めるだけ読み込む.
    ///
    /// 結果として、読み込まれたバイト数(i.e., `buf.len()`)が返される.
    ///
    /// # Errors
    ///
    /// `offset`がクラスタ境界に揃っていない場合や、`buf`が空の場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// 範囲内に未割当のクラスタが含まれている場合には、
    /// 種類が`ErrorKind::InconsistentState`のエラーが返される.
    ///
    /// ボックスファイルの末尾に達して`buf`を埋められなかった場合には、エラーとなる.
    pub fn load(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        track!(self.read_record(buf, offset))?;
        self.metrics.count_load(buf.len() as u64);
        Ok(buf.len())
    }

    /// `offset`の位置にある長さ`length`のレコードを解放する.
    ///
    /// 解放された領域は、以後の割当で即座に再利用され得る.
    /// ただし、マップファイルに反映されるのは次の`flush`の時点となる.
    ///
    /// # Errors
    ///
    /// 範囲がマップの外を指している場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// 範囲内に未割当のクラスタが含まれている場合(e.g., 二重解放)には、
    /// 種類が`ErrorKind::InconsistentState`のエラーが返される.
    pub fn free(&mut self, offset: u64, length: u64) -> Result<()> {
        let (start, count) = track!(self.cluster_range(offset, length))?;
        track!(self.map.release(start, count); offset, length)?;
        self.metrics.count_free(length);
        Ok(())
    }

    /// レコードを再配置する.
    ///
    /// `source`が`None`の場合には、このストレージ内の`offset`の位置にあるレコードを、
    /// それよりも前方にある空き領域に移動する.
    /// 前方に十分な空き領域が存在しない場合には、何も行わずに`offset`をそのまま返す.
    /// 移動が行われた場合には、元の領域は解放される.
    ///
    /// `source`が指定された場合には、`source`内の`offset`の位置にあるレコードを、このストレージに複製する.
    /// `source`側のレコードは解放されないので、必要に応じて利用者が`free`を呼び出す必要がある.
    ///
    /// 結果として、レコードの新しい位置が返される.
    ///
    /// # Errors
    ///
    /// 移動元の範囲に未割当のクラスタが含まれている場合には、何も行われずに、
    /// 種類が`ErrorKind::InconsistentState`のエラーが返される.
    ///
    /// 複製の途中でエラーが発生した場合には、新たに行われた割当は取り消され、
    /// 元のレコードはそのまま残る.
    pub fn compact(
        &mut self,
        offset: u64,
        length: u64,
        source: Option<&mut ClusterStorage>,
    ) -> Result<u64> {
        let (allocation, old_range) = match source {
            Some(ref source) => {
                let (start, count) = track!(source.cluster_range(offset, length))?;
                track_assert!(
                    source.map.is_allocated(start, count),
                    ErrorKind::InconsistentState; offset, length
                );
                (self.map.allocate(self.cluster_size.clusters(length)), None)
            }
            None => {
                let (start, count) = track!(self.cluster_range(offset, length))?;
                track_assert!(
                    self.map.is_allocated(start, count),
                    ErrorKind::InconsistentState; offset, length
                );
                if let Some(allocation) = self.map.allocate_before(count, start) {
                    (allocation, Some((start, count)))
                } else {
                    self.metrics.kept_records.increment();
                    return Ok(offset);
                }
            }
        };
        let (allocation, previous_box_size) = track!(self.ensure_box_covers(allocation))?;
        let new_offset = self.cluster_size.to_bytes(allocation.start());

        let mut buf = vec![0; length as usize];
        let result = match source {
            Some(source) => source.read_record(&mut buf, offset),
            None => self.read_record(&mut buf, offset),
        };
        let result = result.and_then(|()| {
            self.file()
                .and_then(|f| f.write_all_at(new_offset, &[&buf[..]]))
        });
        if let Err(e) = result {
            self.rollback(&allocation, previous_box_size);
            return Err(track!(e; offset, length, new_offset));
        }

        if let Some((start, count)) = old_range {
            track!(self.map.release(start, count))?;
        }
        self.metrics.relocated_records.increment();
        Ok(new_offset)
    }

    /// `live_records`に含まれるレコード以外の全ての領域を解放する.
    ///
    /// 上位層のインデックス等から、使用中のレコードの完全な一覧を得た後に呼び出すことが想定されている.
    ///
    /// # Errors
    ///
    /// `live_records`の要素同士が重なっている場合には、種類が`ErrorKind::InconsistentState`のエラーが返される.
    /// その場合、マップは変更されない.
    pub fn free_unreferenced(&mut self, live_records: &[RecordRange]) -> Result<()> {
        let mut ranges = Vec::with_capacity(live_records.len());
        for r in live_records {
            ranges.push(track!(self.cluster_range(r.offset, r.length))?);
        }
        track!(self.map.rebuild(ranges))?;
        self.update_usage();
        info!(self.logger, "Unreferenced records freed";
              "live_records" => live_records.len(),
              "allocated_clusters" => self.allocated_clusters());
        Ok(())
    }

    /// ボックスファイル末尾の未使用領域を切り詰める.
    ///
    /// 結果として、切り詰め後のボックスファイルのサイズが返される.
    ///
    /// 典型的には、`free_unreferenced`の直後に呼び出される.
    pub fn free_unused(&mut self) -> Result<u64> {
        let allocated_end = self.cluster_size.to_bytes(self.map.trim_unused());

        let file = track!(self.file())?;
        let size = track!(file.size())?;
        let new_size = cmp::min(size, allocated_end);
        if new_size < size {
            track_io!(file.seek(SeekFrom::Start(new_size)))?;
            track!(file.set_end_of_file())?;
            info!(self.logger, "Box file truncated"; "old_size" => size, "new_size" => new_size);
        }
        self.update_usage();
        Ok(new_size)
    }

    /// メモリ上のマップをマップファイルに書き出す.
    ///
    /// 書き出しに先立って、ボックスファイルへの書き込みは物理デバイスに同期される.
    ///
    /// マップに変更が無く、かつマップファイルが既に存在する場合には、何も行われない.
    pub fn flush(&mut self) -> Result<()> {
        let map_path = self.paths.map_path();
        if !self.map.is_dirty() && map_path.exists() {
            return Ok(());
        }

        if let Some(file) = self.file.as_mut() {
            let file = file.as_storage_file();
            track_io!(file.flush())?;
            track!(file.sync())?;
        }
        track!(map_file::save(&map_path, self.map.working().as_bytes()))?;
        self.map.commit();
        self.metrics.map().flushes.increment();
        self.update_usage();
        debug!(self.logger, "Map flushed"; "map_clusters" => self.map.len_clusters());
        Ok(())
    }

    /// マップを書き出した上で、ボックスファイルを閉じる.
    ///
    /// 閉じた後もインスタンスは使用可能であり、次のI/Oの際にボックスファイルが再度開かれる.
    pub fn close(&mut self) -> Result<()> {
        track!(self.flush())?;
        self.file = None;
        info!(self.logger, "Storage closed");
        Ok(())
    }

    /// ストレージの配置場所と名前を変更する.
    ///
    /// マップは書き出された上で、ボックスファイル(を構成する全ての物理ファイル)とマップファイルが移動される.
    ///
    /// # Errors
    ///
    /// 移動はアトミックではないため、エラー時にはファイル群が中途半端な状態で残っている可能性がある.
    pub fn rename<P: AsRef<Path>>(&mut self, dir: P, name: &str) -> Result<()> {
        track!(self.close())?;

        let new_paths = self.paths.relocated(dir, name);
        track_io!(fs::create_dir_all(new_paths.dir()))?;
        if self.layout.is_divided() {
            for (i, path) in self.paths.existing_box_files(true).into_iter().enumerate() {
                track_io!(fs::rename(&path, new_paths.numbered_box_path(i)))?;
            }
        } else {
            for path in self.paths.existing_box_files(false) {
                track_io!(fs::rename(&path, new_paths.box_path()))?;
            }
        }
        track_io!(fs::rename(self.paths.map_path(), new_paths.map_path()))?;

        info!(self.logger, "Storage renamed";
              "new_box_path" => new_paths.box_path().display().to_string());
        self.paths = new_paths;
        self.logger = storage_logger(&self.base_logger, &self.paths);
        Ok(())
    }

    fn file(&mut self) -> Result<&mut dyn StorageFile> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let path = self.paths.box_path();
                match self.layout {
                    BoxLayout::Single => BoxFile::Single(track!(self.file_builder.open_single(path))?),
                    BoxLayout::Divided { block_size } => BoxFile::Divided(track!(self
                        .file_builder
                        .open_divided(path, block_size))?),
                }
            }
        };
        Ok(self.file.get_or_insert(file).as_storage_file())
    }

    fn read_record(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let length = buf.len() as u64;
        let (start, count) = track!(self.cluster_range(offset, length))?;
        track_assert!(
            self.map.is_allocated(start, count),
            ErrorKind::InconsistentState; offset, length
        );
        track!(self.file().and_then(|f| f.read_exact_at(offset, buf)); offset, length)?;
        Ok(())
    }

    // 割当範囲がボックスファイルに収まるように、必要に応じてファイルを伸長する.
    //
    // 伸長が行われた場合には、伸長前のファイルサイズも返す.
    fn ensure_box_covers(&mut self, allocation: Allocation) -> Result<(Allocation, Option<u64>)> {
        if !allocation.reaches_map_tail() {
            return Ok((allocation, None));
        }
        let len = self.cluster_size.to_bytes(allocation.end());
        let size = match self.file().and_then(|f| f.size()) {
            Ok(size) => size,
            Err(e) => {
                self.rollback(&allocation, None);
                return Err(track!(e; len));
            }
        };
        match self.file().and_then(|f| f.ensure_len(len)) {
            Ok(true) => {
                self.metrics.map().extensions.increment();
                self.metrics.map().clusters.set(self.map.len_clusters() as f64);
                Ok((allocation, Some(size)))
            }
            Ok(false) => Ok((allocation, None)),
            Err(e) => {
                self.rollback(&allocation, Some(size));
                Err(track!(e; len))
            }
        }
    }

    // 割当を取り消し、ボックスファイルが伸長されていた場合には元のサイズに戻す.
    //
    // ファイルの切り詰めに失敗した場合でも割当の取り消しは行われる.
    // 残った末尾の領域は、後続の割当での再利用ないし`free_unused`の対象となる.
    fn rollback(&mut self, allocation: &Allocation, previous_box_size: Option<u64>) {
        self.map.rollback(allocation);
        self.metrics.map().rollbacks.increment();
        warn!(self.logger, "Allocation rolled back";
              "start" => allocation.start(), "count" => allocation.count());

        if let Some(size) = previous_box_size {
            let result = self.file().and_then(|f| {
                track_io!(f.seek(SeekFrom::Start(size)))?;
                track!(f.set_end_of_file())
            });
            if let Err(e) = result {
                warn!(self.logger, "Cannot shrink the box file"; "size" => size, "error" => e.to_string());
            }
        }
    }

    // バイト単位の範囲を、クラスタ単位の`(開始位置, クラスタ数)`に変換する.
    fn cluster_range(&self, offset: u64, length: u64) -> Result<(u64, u64)> {
        track_assert!(
            self.cluster_size.is_aligned(offset),
            ErrorKind::InvalidInput,
            "Unaligned offset: offset={}, cluster_size={}",
            offset,
            self.cluster_size.as_u32()
        );
        track_assert!(length != 0, ErrorKind::InvalidInput; offset);
        let start = offset / u64::from(self.cluster_size.as_u32());
        let count = self.cluster_size.clusters(length);
        track_assert!(
            start.checked_add(count).is_some(),
            ErrorKind::InvalidInput; offset, length
        );
        Ok((start, count))
    }

    fn update_usage(&self) {
        self.metrics
            .map()
            .set_usage(self.map.len_clusters(), self.allocated_clusters());
    }
}

pub(crate) fn storage_logger(base: &Logger, paths: &StoragePaths) -> Logger {
    base.new(o!("storage" => paths.box_path().display().to_string()))
}

#[cfg(test)]
mod tests {
    use slog::{Drain, Key, Never, OwnedKVList, Record, Serializer, KV};
    use std::fmt;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::ErrorKind;

    fn load_vec(storage: &mut ClusterStorage, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; length];
        track!(storage.load(&mut buf, offset))?;
        Ok(buf)
    }

    #[test]
    fn first_fit_allocation_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;

        assert_eq!(track!(storage.save(&[&[1; 50][..]]))?, 0);
        assert_eq!(track!(storage.save(&[&[2; 200][..]]))?, 128);
        assert_eq!(track!(storage.save(&[&[3; 50][..]]))?, 384);

        track!(storage.free(128, 200))?;
        assert_eq!(track!(storage.save(&[&[4; 50][..]]))?, 128);

        assert_eq!(track!(load_vec(&mut storage, 0, 50))?, vec![1; 50]);
        assert_eq!(track!(load_vec(&mut storage, 128, 50))?, vec![4; 50]);
        assert_eq!(track!(load_vec(&mut storage, 384, 50))?, vec![3; 50]);
        assert_eq!(storage.allocated_clusters(), 3);
        assert_eq!(storage.metrics().saved_records(), 4);
        assert_eq!(storage.metrics().freed_bytes(), 200);
        Ok(())
    }

    #[test]
    fn scattered_buffers_are_saved_contiguously() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;

        let offset = track!(storage.save(&[b"foo", b"", b"barbaz"]))?;
        assert_eq!(track!(load_vec(&mut storage, offset, 9))?, b"foobarbaz");

        // 途中までの読み込みも可能
        assert_eq!(track!(load_vec(&mut storage, offset, 3))?, b"foo");
        Ok(())
    }

    #[test]
    fn map_bits_are_msb_first() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        track!(storage.save(&[&[0; 50][..]]))?;
        track!(storage.save(&[&[0; 300][..]]))?;
        track!(storage.flush())?;

        let map = track_io!(fs::read(storage.paths().map_path()))?;
        assert_eq!(map, [0xF0]);
        assert_eq!(track!(storage.box_size())?, 512);
        Ok(())
    }

    #[test]
    fn reopen_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[b"hello"]))?;
        let b = track!(storage.save(&[&[7; 1000][..]]))?;
        track!(storage.close())?;

        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        assert!(!storage.is_dirty());
        assert_eq!(storage.allocated_clusters(), 9);
        assert_eq!(track!(load_vec(&mut storage, a, 5))?, b"hello");
        assert_eq!(track!(load_vec(&mut storage, b, 1000))?, vec![7; 1000]);

        // 既存のレコードとは重ならない
        let c = track!(storage.save(&[b"world"]))?;
        assert_eq!(c, 9 * 128);
        Ok(())
    }

    #[test]
    fn close_keeps_the_instance_usable() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[b"hello"]))?;
        track!(storage.close())?;

        assert_eq!(track!(load_vec(&mut storage, a, 5))?, b"hello");
        let b = track!(storage.save(&[b"world"]))?;
        assert_eq!(track!(load_vec(&mut storage, b, 5))?, b"world");
        Ok(())
    }

    #[test]
    fn free_becomes_durable_on_flush() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[b"hello"]))?;
        track!(storage.flush())?;
        assert!(track!(storage.is_durably_allocated(a, 5))?);

        track!(storage.free(a, 5))?;
        assert!(storage.is_dirty());
        assert!(!track!(storage.is_allocated(a, 5))?);
        assert!(track!(storage.is_durably_allocated(a, 5))?);

        // flushせずに破棄すると、解放は無かったことになる
        std::mem::drop(storage);
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        assert!(track!(storage.is_allocated(a, 5))?);
        assert_eq!(track!(load_vec(&mut storage, a, 5))?, b"hello");

        track!(storage.free(a, 5))?;
        track!(storage.flush())?;
        assert!(!storage.is_dirty());
        assert!(!track!(storage.is_durably_allocated(a, 5))?);

        std::mem::drop(storage);
        let storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        assert!(!track!(storage.is_allocated(a, 5))?);
        Ok(())
    }

    #[test]
    fn flush_is_idempotent() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        for i in 0..20 {
            track!(storage.save(&[&vec![i; 100 * i as usize + 1][..]]))?;
        }
        track!(storage.free(128, 1))?;

        track!(storage.flush())?;
        let first = track_io!(fs::read(storage.paths().map_path()))?;
        track!(storage.flush())?;
        let second = track_io!(fs::read(storage.paths().map_path()))?;
        assert_eq!(first, second);
        assert_eq!(storage.metrics().map().flushes(), 1);

        // マップファイルが失われた場合には、変更が無くても書き出す
        track_io!(fs::remove_file(storage.paths().map_path()))?;
        track!(storage.flush())?;
        let third = track_io!(fs::read(storage.paths().map_path()))?;
        assert_eq!(first, third);
        Ok(())
    }

    #[test]
    fn invalid_operations_are_rejected() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[b"hello"]))?;

        fn kind<T>(r: Result<T>) -> Option<ErrorKind> {
            r.err().map(|e| *e.kind())
        }

        assert_eq!(kind(storage.save(&[])), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.save(&[b""])), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.load(&mut [0; 5], a + 1)), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.load(&mut [], a)), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.free(a + 1, 5)), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.free(1280, 5)), Some(ErrorKind::InvalidInput));

        // 未割当領域へのアクセス
        assert_eq!(
            kind(storage.load(&mut [0; 5], 128)),
            Some(ErrorKind::InconsistentState)
        );
        assert_eq!(
            kind(storage.compact(128, 5, None)),
            Some(ErrorKind::InconsistentState)
        );

        // 二重解放
        track!(storage.free(a, 5))?;
        assert_eq!(kind(storage.free(a, 5)), Some(ErrorKind::InconsistentState));
        assert_eq!(
            kind(storage.load(&mut [0; 5], a)),
            Some(ErrorKind::InconsistentState)
        );

        // 範囲の終端がオーバーフローする
        let mut storage = track!(StorageBuilder::new()
            .cluster_size(track!(ClusterSize::new(1))?)
            .open(dir.path(), "bytes"))?;
        track!(storage.save(&[b"a"]))?;
        assert_eq!(kind(storage.free(1, u64::MAX)), Some(ErrorKind::InvalidInput));
        assert_eq!(kind(storage.is_allocated(1, u64::MAX)), Some(ErrorKind::InvalidInput));
        assert_eq!(
            kind(storage.compact(1, u64::MAX, None)),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(storage.allocated_clusters(), 1);
        Ok(())
    }

    #[test]
    fn compact_within_storage_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[&[1; 50][..]]))?;
        let b = track!(storage.save(&[&[2; 300][..]]))?;
        let c = track!(storage.save(&[&[3; 50][..]]))?;
        assert_eq!((a, b, c), (0, 128, 512));
        track!(storage.free(a, 50))?;

        // 前方に十分な空きがないので移動しない
        assert_eq!(track!(storage.compact(b, 300, None))?, b);

        // 先頭の空き領域に移動する
        let new_c = track!(storage.compact(c, 50, None))?;
        assert_eq!(new_c, 0);
        assert_eq!(track!(load_vec(&mut storage, new_c, 50))?, vec![3; 50]);
        assert!(!track!(storage.is_allocated(c, 50))?);
        assert_eq!(storage.metrics().compacted_records(), (1, 1));

        // 末尾が空いたので切り詰められる
        assert_eq!(track!(storage.box_size())?, 640);
        assert_eq!(track!(storage.free_unused())?, 512);
        assert_eq!(track!(storage.box_size())?, 512);
        assert_eq!(track!(load_vec(&mut storage, b, 300))?, vec![2; 300]);
        Ok(())
    }

    #[test]
    fn compact_from_another_storage_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut source = track!(ClusterStorage::open(dir.path(), "source"))?;
        let mut destination = track!(ClusterStorage::open(dir.path(), "destination"))?;

        let a = track!(source.save(&[&[1; 10][..]]))?;
        let b = track!(source.save(&[&[2; 200][..]]))?;
        let x = track!(destination.save(&[&[9; 10][..]]))?;
        assert_eq!((a, b, x), (0, 128, 0));

        let new_b = track!(destination.compact(b, 200, Some(&mut source)))?;
        assert_eq!(new_b, 128);
        assert_eq!(track!(load_vec(&mut destination, new_b, 200))?, vec![2; 200]);
        assert_eq!(track!(load_vec(&mut destination, x, 10))?, vec![9; 10]);

        // コピー元のレコードは残っている
        assert_eq!(track!(load_vec(&mut source, b, 200))?, vec![2; 200]);

        // コピー元に存在しないレコードの場合には、コピー先は一切変更されない
        let box_size = track!(destination.box_size())?;
        for &(offset, length) in &[(512, 10), (0, 1 << 40), (128, 300)] {
            let result = destination.compact(offset, length, Some(&mut source));
            assert_eq!(
                result.err().map(|e| *e.kind()),
                Some(ErrorKind::InconsistentState)
            );
        }
        assert_eq!(destination.allocated_clusters(), 3);
        assert_eq!(track!(destination.box_size())?, box_size);
        assert_eq!(destination.metrics().map().rollbacks(), 0);
        assert_eq!(track!(destination.save(&[b"next"]))?, 384);
        Ok(())
    }

    #[test]
    fn free_unreferenced_and_free_unused_work() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let mut records = Vec::new();
        for i in 0..5 {
            let offset = track!(storage.save(&[&[i; 100][..]]))?;
            records.push(RecordRange::new(offset, 100));
        }
        assert_eq!(track!(storage.box_size())?, 640);

        let live = vec![records[0], records[2]];
        track!(storage.free_unreferenced(&live))?;
        assert_eq!(storage.allocated_clusters(), 2);

        let size = track!(storage.free_unused())?;
        assert_eq!(size, 384);
        assert!(size >= live.iter().map(|r| r.end()).max().unwrap_or(0));
        assert_eq!(track!(storage.box_size())?, 384);
        for r in &live {
            let expected = vec![(r.offset / 128) as u8; 100];
            assert_eq!(track!(load_vec(&mut storage, r.offset, 100))?, expected);
        }

        // 空き領域は再利用され、必要に応じてファイルが伸長される
        assert_eq!(track!(storage.save(&[&[9; 100][..]]))?, 128);
        assert_eq!(track!(storage.save(&[&[9; 300][..]]))?, 384);
        assert_eq!(track!(storage.box_size())?, 768);

        // 重なり合う範囲はエラー
        let overlapped = vec![RecordRange::new(0, 200), RecordRange::new(128, 10)];
        let e = storage.free_unreferenced(&overlapped).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InconsistentState));
        assert_eq!(storage.allocated_clusters(), 6);

        // マップの外を指す範囲はエラーとなり、マップは伸長されない
        let beyond = vec![RecordRange::new(0, 100), RecordRange::new(1024, 128)];
        let e = storage.free_unreferenced(&beyond).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        let huge = vec![RecordRange::new(0, 1 << 50)];
        let e = storage.free_unreferenced(&huge).err().map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::InvalidInput));
        assert_eq!(storage.allocated_clusters(), 6);
        assert_eq!(track!(storage.free_unused())?, 768);
        Ok(())
    }

    #[test]
    fn missing_map_is_resynthesized() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[&[1; 50][..]]))?;
        track!(storage.save(&[&[2; 200][..]]))?;
        let c = track!(storage.save(&[&[3; 50][..]]))?;
        std::mem::drop(storage);
        assert!(!dir.path().join("inbox.map").exists());

        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        assert!(storage.is_dirty());
        assert_eq!(storage.allocated_clusters(), 4);
        assert_eq!(storage.metrics().map().resyntheses(), 1);

        track!(storage.free_unreferenced(&[RecordRange::new(a, 50), RecordRange::new(c, 50)]))?;
        assert_eq!(track!(storage.save(&[&[4; 200][..]]))?, 128);
        track!(storage.flush())?;
        assert!(dir.path().join("inbox.map").exists());
        assert_eq!(track!(load_vec(&mut storage, c, 50))?, vec![3; 50]);
        Ok(())
    }

    #[test]
    fn missing_box_file_is_detected() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        track!(storage.save(&[b"hello"]))?;
        track!(storage.close())?;
        track_io!(fs::remove_file(dir.path().join("inbox.box")))?;

        let e = ClusterStorage::open(dir.path(), "inbox")
            .err()
            .map(|e| *e.kind());
        assert_eq!(e, Some(ErrorKind::StorageCorrupted));

        // 割当の無いマップであれば問題ない
        track!(map_file::save(&dir.path().join("inbox.map"), &[0, 0]))?;
        assert!(ClusterStorage::open(dir.path(), "inbox").is_ok());
        Ok(())
    }

    #[test]
    fn divided_storage_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut builder = StorageBuilder::new();
        builder.divided(256);

        let mut storage = track!(builder.open(dir.path(), "inbox"))?;
        assert!(storage.layout().is_divided());
        let mut offsets = Vec::new();
        for i in 0..3 {
            offsets.push(track!(storage.save(&[&[i; 200][..]]))?);
        }
        assert_eq!(offsets, [0, 256, 512]);
        let big = track!(storage.save(&[&[9; 400][..]]))?;
        assert_eq!(big, 768);

        let paths = storage.paths().clone();
        assert_eq!(paths.existing_box_files(true).len(), 5);
        assert!(!paths.box_path().exists());

        track!(storage.rename(dir.path().join("archive"), "old"))?;
        assert!(paths.existing_box_files(true).is_empty());
        assert!(!paths.map_path().exists());
        assert_eq!(storage.paths().name(), "old");
        assert_eq!(storage.paths().existing_box_files(true).len(), 5);
        assert!(dir.path().join("archive/old003.box").exists());
        assert!(dir.path().join("archive/old.map").exists());

        for (i, offset) in offsets.iter().enumerate() {
            assert_eq!(track!(load_vec(&mut storage, *offset, 200))?, vec![i as u8; 200]);
        }
        assert_eq!(track!(load_vec(&mut storage, big, 400))?, vec![9; 400]);

        // 末尾のファイル群は、切り詰めの際に削除される
        track!(storage.free(big, 400))?;
        assert_eq!(track!(storage.free_unused())?, 768);
        assert_eq!(storage.paths().existing_box_files(true).len(), 3);

        track!(storage.close())?;
        let mut storage = track!(builder.open(dir.path().join("archive"), "old"))?;
        assert_eq!(storage.allocated_clusters(), 6);
        assert_eq!(track!(load_vec(&mut storage, 512, 200))?, vec![2; 200]);
        Ok(())
    }

    #[test]
    fn failed_save_is_rolled_back() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(StorageBuilder::new()
            .divided(256)
            .open(dir.path(), "inbox"))?;

        // 二番目の物理ファイルが開けない
        let blocker = storage.paths().numbered_box_path(1);
        track_io!(fs::create_dir(&blocker))?;
        assert!(storage.save(&[&[1; 300][..]]).is_err());
        assert_eq!(storage.allocated_clusters(), 0);
        assert_eq!(storage.metrics().map().rollbacks(), 1);
        assert_eq!(storage.metrics().saved_records(), 0);

        // 伸長されたファイルも元のサイズに戻されている
        track_io!(fs::remove_dir(&blocker))?;
        assert_eq!(track!(storage.box_size())?, 0);

        let offset = track!(storage.save(&[&[1; 300][..]]))?;
        assert_eq!(offset, 0);
        assert_eq!(track!(load_vec(&mut storage, offset, 300))?, vec![1; 300]);
        assert_eq!(storage.allocated_clusters(), 3);
        assert_eq!(track!(storage.box_size())?, 384);
        Ok(())
    }

    #[derive(Clone, Default)]
    struct StoragePathRecorder(Arc<Mutex<Vec<Vec<String>>>>);
    impl Drain for StoragePathRecorder {
        type Ok = ();
        type Err = Never;
        fn log(&self, record: &Record, values: &OwnedKVList) -> std::result::Result<(), Never> {
            let mut paths = StoragePathValues(Vec::new());
            let _ = values.serialize(record, &mut paths);
            if let Ok(mut logs) = self.0.lock() {
                logs.push(paths.0);
            }
            Ok(())
        }
    }

    struct StoragePathValues(Vec<String>);
    impl Serializer for StoragePathValues {
        fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
            if key == "storage" {
                self.0.push(val.to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn logger_follows_renamed_storage() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let recorder = StoragePathRecorder::default();
        let mut storage = track!(StorageBuilder::new()
            .logger(Logger::root(recorder.clone(), o!()))
            .open(dir.path(), "inbox"))?;
        track!(storage.save(&[b"foo"]))?;
        track!(storage.rename(dir.path(), "archive"))?;
        track!(storage.close())?;

        let logs = recorder.0.lock().map(|logs| logs.clone()).unwrap_or_default();
        let new_path = dir.path().join("archive.box").display().to_string();
        assert_eq!(logs.last(), Some(&vec![new_path]));
        Ok(())
    }

    #[test]
    fn rename_single_storage_works() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(ClusterStorage::open(dir.path(), "inbox"))?;
        let a = track!(storage.save(&[b"hello"]))?;
        track!(storage.rename(dir.path(), "trash"))?;

        assert!(!dir.path().join("inbox.box").exists());
        assert!(!dir.path().join("inbox.map").exists());
        assert!(dir.path().join("trash.box").exists());
        assert!(dir.path().join("trash.map").exists());
        assert_eq!(track!(load_vec(&mut storage, a, 5))?, b"hello");
        Ok(())
    }

    #[test]
    fn random_operations_never_overlap() -> TestResult {
        let dir = track_io!(TempDir::new("clusterstore_test"))?;
        let mut storage = track!(StorageBuilder::new()
            .cluster_size(track!(ClusterSize::new(16))?)
            .open(dir.path(), "inbox"))?;

        let mut live: Vec<(RecordRange, u8)> = Vec::new();
        let mut seed = 7u64;
        for i in 0..500 {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let r = seed >> 33;
            if r % 4 == 0 && !live.is_empty() {
                let (range, _) = live.swap_remove(r as usize % live.len());
                track!(storage.free(range.offset, range.length))?;
            } else if r % 17 == 0 && !live.is_empty() {
                let index = r as usize % live.len();
                let range = live[index].0;
                let offset = track!(storage.compact(range.offset, range.length, None))?;
                assert!(offset <= range.offset);
                live[index].0.offset = offset;
            } else {
                let length = 1 + r % 100;
                let value = i as u8;
                let offset = track!(storage.save(&[&vec![value; length as usize][..]]))?;
                live.push((RecordRange::new(offset, length), value));
            }
            if i % 100 == 0 {
                track!(storage.flush())?;
            }
        }

        let mut ranges = live.iter().map(|x| x.0).collect::<Vec<_>>();
        ranges.sort();
        for w in ranges.windows(2) {
            let end = storage.cluster_size().ceil_align(w[0].end());
            assert!(end <= w[1].offset, "{:?} overlaps {:?}", w[0], w[1]);
        }

        track!(storage.close())?;
        let mut storage = track!(StorageBuilder::new()
            .cluster_size(track!(ClusterSize::new(16))?)
            .open(dir.path(), "inbox"))?;
        for (range, value) in &live {
            let data = track!(load_vec(&mut storage, range.offset, range.length as usize))?;
            assert_eq!(data, vec![*value; range.length as usize]);
        }
        Ok(())
    }
}
