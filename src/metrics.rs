//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

use crate::storage::ClusterSize;

/// [`ClusterStorage`]のメトリクス.
///
/// [`ClusterStorage`]: ../storage/struct.ClusterStorage.html
///
/// # Prometheus
///
/// `Methods`節に記載の無いメトリクスのみを掲載:
///
/// ```prometheus
/// clusterstore_storage_cluster_size { } <CLUSTER_SIZE>
/// ```
#[derive(Debug, Clone)]
pub struct StorageMetrics {
    pub(crate) saved_records: Counter,
    pub(crate) saved_bytes: Counter,
    pub(crate) loaded_records: Counter,
    pub(crate) loaded_bytes: Counter,
    pub(crate) freed_records: Counter,
    pub(crate) freed_bytes: Counter,
    pub(crate) relocated_records: Counter,
    pub(crate) kept_records: Counter,
    cluster_size: Gauge,
    map: MapMetrics,
}
impl StorageMetrics {
    /// 保存されたレコードの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_saved_records_total <COUNTER>
    /// ```
    pub fn saved_records(&self) -> u64 {
        self.saved_records.value() as u64
    }

    /// 保存されたレコードの合計バイト数.
    ///
    /// クラスタ境界への切り上げ前の値である.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_saved_bytes_total <COUNTER>
    /// ```
    pub fn saved_bytes(&self) -> u64 {
        self.saved_bytes.value() as u64
    }

    /// 読み込まれたレコードの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_loaded_records_total <COUNTER>
    /// ```
    pub fn loaded_records(&self) -> u64 {
        self.loaded_records.value() as u64
    }

    /// 読み込まれたレコードの合計バイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_loaded_bytes_total <COUNTER>
    /// ```
    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes.value() as u64
    }

    /// 解放されたレコードの数.
    ///
    /// `free_unreferenced`による一括解放は含まれない.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_freed_records_total <COUNTER>
    /// ```
    pub fn freed_records(&self) -> u64 {
        self.freed_records.value() as u64
    }

    /// 解放されたレコードの合計バイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_freed_bytes_total <COUNTER>
    /// ```
    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes.value() as u64
    }

    /// コンパクションの対象となったレコードの数.
    ///
    /// 返り値のタプルの第一要素は実際に再配置されたレコードの数で、
    /// 第二要素はより前方に空きが無く、元の位置に留まったレコードの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_storage_compacted_records_total { result="relocated|kept" } <COUNTER>
    /// ```
    pub fn compacted_records(&self) -> (u64, u64) {
        (
            self.relocated_records.value() as u64,
            self.kept_records.value() as u64,
        )
    }

    /// ストレージのクラスタサイズ.
    pub fn cluster_size(&self) -> u32 {
        self.cluster_size.value() as u32
    }

    /// マップのメトリクスを返す.
    pub fn map(&self) -> &MapMetrics {
        &self.map
    }

    pub(crate) fn new(builder: &MetricBuilder, cluster_size: ClusterSize) -> Self {
        let map = MapMetrics::new(builder);
        let mut builder = builder.clone();
        builder.namespace("clusterstore").subsystem("storage");
        StorageMetrics {
            saved_records: builder
                .counter("saved_records_total")
                .help("Number of records saved on the storage")
                .finish()
                .expect("Never fails"),
            saved_bytes: builder
                .counter("saved_bytes_total")
                .help("Number of bytes saved on the storage")
                .finish()
                .expect("Never fails"),
            loaded_records: builder
                .counter("loaded_records_total")
                .help("Number of records loaded from the storage")
                .finish()
                .expect("Never fails"),
            loaded_bytes: builder
                .counter("loaded_bytes_total")
                .help("Number of bytes loaded from the storage")
                .finish()
                .expect("Never fails"),
            freed_records: builder
                .counter("freed_records_total")
                .help("Number of records freed from the storage")
                .finish()
                .expect("Never fails"),
            freed_bytes: builder
                .counter("freed_bytes_total")
                .help("Number of bytes freed from the storage")
                .finish()
                .expect("Never fails"),
            relocated_records: builder
                .counter("compacted_records_total")
                .help("Number of records processed by compaction")
                .label("result", "relocated")
                .finish()
                .expect("Never fails"),
            kept_records: builder
                .counter("compacted_records_total")
                .help("Number of records processed by compaction")
                .label("result", "kept")
                .finish()
                .expect("Never fails"),
            cluster_size: builder
                .gauge("cluster_size")
                .help("Allocation unit of the storage")
                .initial_value(f64::from(cluster_size.as_u32()))
                .finish()
                .expect("Never fails"),
            map,
        }
    }

    pub(crate) fn count_save(&self, bytes: u64) {
        self.saved_records.increment();
        self.saved_bytes.add_u64(bytes);
    }

    pub(crate) fn count_load(&self, bytes: u64) {
        self.loaded_records.increment();
        self.loaded_bytes.add_u64(bytes);
    }

    pub(crate) fn count_free(&self, bytes: u64) {
        self.freed_records.increment();
        self.freed_bytes.add_u64(bytes);
    }
}

/// 空き領域マップのメトリクス.
#[derive(Debug, Clone)]
pub struct MapMetrics {
    pub(crate) clusters: Gauge,
    pub(crate) allocated_clusters: Gauge,
    pub(crate) extensions: Counter,
    pub(crate) rollbacks: Counter,
    pub(crate) flushes: Counter,
    pub(crate) resyntheses: Counter,
}
impl MapMetrics {
    /// マップが管理しているクラスタ数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_clusters <GAUGE>
    /// ```
    pub fn clusters(&self) -> u64 {
        self.clusters.value() as u64
    }

    /// 割当済みのクラスタ数.
    ///
    /// 値は、マップの伸縮や書き出し、再構築の際に更新される.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_allocated_clusters <GAUGE>
    /// ```
    pub fn allocated_clusters(&self) -> u64 {
        self.allocated_clusters.value() as u64
    }

    /// ボックスファイルの伸長回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_extensions_total <COUNTER>
    /// ```
    pub fn extensions(&self) -> u64 {
        self.extensions.value() as u64
    }

    /// 失敗した割当が取り消された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_rollbacks_total <COUNTER>
    /// ```
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.value() as u64
    }

    /// マップファイルが書き出された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_flushes_total <COUNTER>
    /// ```
    pub fn flushes(&self) -> u64 {
        self.flushes.value() as u64
    }

    /// マップファイルの欠落により、マップが再構築された回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// clusterstore_map_resyntheses_total <COUNTER>
    /// ```
    pub fn resyntheses(&self) -> u64 {
        self.resyntheses.value() as u64
    }

    fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("clusterstore").subsystem("map");
        MapMetrics {
            clusters: builder
                .gauge("clusters")
                .help("Number of clusters tracked by the free-space map")
                .finish()
                .expect("Never fails"),
            allocated_clusters: builder
                .gauge("allocated_clusters")
                .help("Number of allocated clusters")
                .finish()
                .expect("Never fails"),
            extensions: builder
                .counter("extensions_total")
                .help("Number of box file extensions")
                .finish()
                .expect("Never fails"),
            rollbacks: builder
                .counter("rollbacks_total")
                .help("Number of rolled back allocations")
                .finish()
                .expect("Never fails"),
            flushes: builder
                .counter("flushes_total")
                .help("Number of map file writes")
                .finish()
                .expect("Never fails"),
            resyntheses: builder
                .counter("resyntheses_total")
                .help("Number of maps rebuilt from the box file size")
                .finish()
                .expect("Never fails"),
        }
    }

    pub(crate) fn set_usage(&self, clusters: u64, allocated_clusters: u64) {
        self.clusters.set(clusters as f64);
        self.allocated_clusters.set(allocated_clusters as f64);
    }
}
