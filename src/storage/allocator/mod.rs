//! ボックスファイル用のアロケータ.
//!
//! アロケータは、クラスタ単位のビットマップ(空き領域マップ)を保持し、
//! 個々のレコードに対して、必要な数の連続したクラスタを割り当てる責務を負っている。
//!
//! アロケータが担当するのは、領域の計算処理のみで、実際のデータの読み書き等を、この中で行うことは無い.
//! ファイルの伸長やマップファイルへの書き出しは[ClusterStorage]が担当する.
//!
//! [ClusterStorage]: ../struct.ClusterStorage.html
pub use self::bitmap::{ClusterBitmap, RunSearch};
pub use self::free_map::{Allocation, FreeMap};
pub use self::search_hint::{SearchHints, SEARCH_HINT_SLOTS};

mod bitmap;
mod free_map;
mod search_hint;
