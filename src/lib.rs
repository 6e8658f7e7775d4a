//! Cluster Storage.
//!
//! `clusterstore`は、可変長のレコード群を一つ(ないし複数)の伸長可能なファイルに多重化して格納する、
//! 組み込み用のストレージエンジン.
//!
//! # 特徴
//!
//! - レコードは固定長の"クラスタ"(デフォルトは128バイト)単位で割り当てられる
//! - 空き領域は「一クラスタ一ビット」のビットマップ(マップファイル)で管理される
//!   - 割当はファーストフィット戦略で、サイズ毎の探索開始位置ヒントによって走査範囲を削減する
//! - レコードの中身は解釈しない(利用者が返されたオフセットと長さを管理する)
//! - 割当は即座にメモリ上のマップに反映されるが、解放がディスク上のマップに反映されるのは`flush`時のみ
//! - レコードの再配置(コンパクション)や、参照されなくなった領域の一括回収をサポート
//! - トランザクションや複数プロセスからの同時アクセス、暗号化は提供しない
//!
//! # モジュールの依存関係
//!
//! ```text
//! storage => (allocator, map_file, paths) => file
//! ```
//!
//! - [storage]モジュール:
//!   - 主に[ClusterStorage]構造体を提供
//!   - `clusterstore`の利用者が直接触るのはこの構造体
//!   - 内部の[allocator]サブモジュールが、I/Oから切り離された空き領域管理を担当する
//! - [metrics]モジュール:
//!   - [Prometheus]用のメトリクスを提供
//! - [file]モジュール:
//!   - 主に[StorageFile]トレイトとその実装である[SingleFile]および[DividedFile]を提供
//!   - [storage]に対して永続化層を提供するのが目的
//!
//! [storage]: ./storage/index.html
//! [ClusterStorage]: ./storage/struct.ClusterStorage.html
//! [allocator]: ./storage/allocator/index.html
//! [metrics]: ./metrics/index.html
//! [Prometheus]: https://prometheus.io/
//! [file]: ./file/index.html
//! [StorageFile]: ./file/trait.StorageFile.html
//! [SingleFile]: ./file/struct.SingleFile.html
//! [DividedFile]: ./file/struct.DividedFile.html
#![warn(missing_docs)]
extern crate libc;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
extern crate tempfile;
#[macro_use]
extern crate trackable;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod file;
pub mod metrics;
pub mod storage;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
