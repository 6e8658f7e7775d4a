use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::fs;
use std::path::Path;

use crate::file::StorageFileBuilder;
use crate::metrics::StorageMetrics;
use crate::storage::allocator::FreeMap;
use crate::storage::{
    map_file, storage_logger, BoxLayout, ClusterSize, ClusterStorage, StoragePaths,
};
use crate::{ErrorKind, Result};

/// `ClusterStorage`のビルダ.
#[derive(Debug, Clone)]
pub struct StorageBuilder {
    cluster_size: ClusterSize,
    layout: BoxLayout,
    box_extension: String,
    map_extension: String,
    file: StorageFileBuilder,
    logger: Logger,
    metrics: MetricBuilder,
}
impl StorageBuilder {
    /// 新しい`StorageBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        StorageBuilder {
            cluster_size: ClusterSize::default(),
            layout: BoxLayout::Single,
            box_extension: "box".to_owned(),
            map_extension: "map".to_owned(),
            file: StorageFileBuilder::new(),
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// ストレージのクラスタサイズを設定する.
    ///
    /// デフォルト値は`ClusterSize::default()`(i.e., 128バイト).
    ///
    /// # 注意
    ///
    /// マップファイルにはクラスタサイズが記録されないため、
    /// 既存のストレージを開く際には、作成時と同じ値を指定する必要がある.
    pub fn cluster_size(&mut self, cluster_size: ClusterSize) -> &mut Self {
        self.cluster_size = cluster_size;
        self
    }

    /// ボックスファイルを、`block_size`バイト毎の複数の物理ファイルに分割して格納するようにする.
    ///
    /// デフォルトでは分割は行われない.
    ///
    /// `block_size`はクラスタサイズの倍数である必要があり、
    /// そうではない場合には、ストレージのオープン時にエラーが返される.
    pub fn divided(&mut self, block_size: u64) -> &mut Self {
        self.layout = BoxLayout::Divided { block_size };
        self
    }

    /// ボックスファイルの拡張子を設定する.
    ///
    /// デフォルト値は`"box"`.
    pub fn box_extension(&mut self, extension: &str) -> &mut Self {
        self.box_extension = extension.to_owned();
        self
    }

    /// マップファイルの拡張子を設定する.
    ///
    /// デフォルト値は`"map"`.
    pub fn map_extension(&mut self, extension: &str) -> &mut Self {
        self.map_extension = extension.to_owned();
        self
    }

    /// 物理ファイルに対して排他ロックを取得するかどうかを設定する.
    ///
    /// デフォルト値は`false`.
    ///
    /// 詳細は`StorageFileBuilder::exclusive_lock`を参照のこと.
    pub fn exclusive_lock(&mut self, enabled: bool) -> &mut Self {
        self.file.exclusive_lock(enabled);
        self
    }

    /// ストレージ用の logger を登録する.
    ///
    /// デフォルトでは、ログは全て破棄される.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// `dir`ディレクトリ内の`name`という名前のストレージを開く.
    ///
    /// ストレージが存在しない場合には、新規に作成されたものとして扱われる.
    /// (実際のファイルは、最初の書き込みないし`flush`の時点で作成される)
    ///
    /// マップファイルが存在せず、ボックスファイルのみが存在する場合には、
    /// ボックスファイルがカバーする全てのクラスタを割当済みとしてマップが再構築される.
    /// その後に`free_unreferenced`を呼び出して、実際に使用中の領域を指定するのが典型的な使い方となる.
    ///
    /// # Errors
    ///
    /// マップファイル上に割当済みのクラスタが存在するにも関わらず、
    /// ボックスファイルが存在しない場合には、種類が`ErrorKind::StorageCorrupted`のエラーが返される.
    ///
    /// 分割サイズがクラスタサイズの倍数ではない場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn open<P: AsRef<Path>>(&self, dir: P, name: &str) -> Result<ClusterStorage> {
        if let BoxLayout::Divided { block_size } = self.layout {
            let cluster_size = u64::from(self.cluster_size.as_u32());
            track_assert!(
                block_size != 0 && block_size % cluster_size == 0,
                ErrorKind::InvalidInput; block_size, cluster_size
            );
        }

        let paths = StoragePaths::new(dir, name, &self.box_extension, &self.map_extension);
        let logger = storage_logger(&self.logger, &paths);
        let metrics = StorageMetrics::new(&self.metrics, self.cluster_size);

        let map_path = paths.map_path();
        let box_size = track!(existing_box_size(&paths, self.layout))?;
        let map = match track!(map_file::load(&map_path))? {
            Some(bytes) => {
                let map = FreeMap::from_committed(bytes);
                track_assert!(
                    box_size.is_some() || map.working().count_set() == 0,
                    ErrorKind::StorageCorrupted,
                    "Box file is missing: map={:?}",
                    map_path
                );
                map
            }
            None => {
                if let Some(size) = box_size {
                    let clusters = self.cluster_size.clusters(size);
                    warn!(logger, "Map file is missing, rebuilt from the box file";
                          "box_size" => size, "clusters" => clusters);
                    metrics.map().resyntheses.increment();
                    FreeMap::resynthesized(clusters)
                } else {
                    FreeMap::new()
                }
            }
        };
        info!(logger, "Storage opened";
              "map_clusters" => map.len_clusters(),
              "allocated_clusters" => map.working().count_set());

        Ok(ClusterStorage::new(
            paths,
            self.layout,
            self.cluster_size,
            self.file.clone(),
            map,
            self.logger.clone(),
            metrics,
        ))
    }
}
impl Default for StorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ボックスファイルの現在のサイズを返す(存在しない場合は`None`).
fn existing_box_size(paths: &StoragePaths, layout: BoxLayout) -> Result<Option<u64>> {
    let files = paths.existing_box_files(layout.is_divided());
    if let Some(last) = files.last() {
        let last_len = track_io!(fs::metadata(last))?.len();
        let preceding_len = match layout {
            BoxLayout::Single => 0,
            BoxLayout::Divided { block_size } => block_size * (files.len() as u64 - 1),
        };
        Ok(Some(preceding_len + last_len))
    } else {
        Ok(None)
    }
}
