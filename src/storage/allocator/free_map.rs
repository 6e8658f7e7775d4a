use crate::storage::allocator::{ClusterBitmap, RunSearch, SearchHints};
use crate::{ErrorKind, Result};

/// 空き領域マップ.
///
/// 以下の二つのビットマップを保持する:
///
/// - 作業用マップ(working):
///   - 割当・解放が即座に反映されるメモリ上のマップ
///   - 新しい割当の探索は、このマップに対して行われる
/// - 確定済みマップ(committed):
///   - 最後にマップファイルに書き出された内容のスナップショット
///   - `commit`メソッドの呼び出し時にのみ更新される
///
/// 解放された領域は作業用マップ上では即座に再利用可能となるが、
/// その解放が永続化されるのは、次に`commit`(i.e., マップファイルへの書き出し)が行われた時点となる.
///
/// 割当の際には、ファーストフィット戦略に従って、条件を満たす最も前方の空き領域が選択される.
/// 十分な空き領域が存在しない場合には、マップが伸長される.
#[derive(Debug, Clone)]
pub struct FreeMap {
    working: ClusterBitmap,
    committed: ClusterBitmap,
    hints: SearchHints,
}
impl FreeMap {
    /// 空のマップを生成する.
    pub fn new() -> Self {
        FreeMap {
            working: ClusterBitmap::new(),
            committed: ClusterBitmap::new(),
            hints: SearchHints::new(),
        }
    }

    /// マップファイルから読み込んだ内容を用いて、マップを生成する.
    pub fn from_committed(bytes: Vec<u8>) -> Self {
        let committed = ClusterBitmap::from_bytes(bytes);
        FreeMap {
            working: committed.clone(),
            committed,
            hints: SearchHints::new(),
        }
    }

    /// 先頭から`clusters`個のクラスタが全て割当済みのマップを生成する.
    ///
    /// マップファイルが失われた場合の再構築に使用される.
    /// 結果のマップは、未書き出しの状態となる.
    pub fn resynthesized(clusters: u64) -> Self {
        let mut working = ClusterBitmap::new();
        working.grow_to(clusters);
        working.set_range(0, clusters);
        FreeMap {
            working,
            committed: ClusterBitmap::new(),
            hints: SearchHints::new(),
        }
    }

    /// `count`個の連続したクラスタを割り当てる.
    ///
    /// 十分な空き領域が存在しない場合には、末尾の空き領域を利用しつつ、マップを伸長する.
    pub fn allocate(&mut self, count: u64) -> Allocation {
        debug_assert!(count > 0);
        let previous_len = self.working.len_bytes();
        let from = self.hints.get(count);
        let start = match self.working.find_clear_run(from, count, None) {
            RunSearch::Found(start) => start,
            _ => {
                let start = self.working.trailing_clear_start();
                self.working.grow_to(start + count);
                start
            }
        };
        self.working.set_range(start, count);
        self.hints.raise(count, start + count);
        Allocation {
            start,
            count,
            previous_len,
        }
    }

    /// `limit`より前方に収まる`count`個の連続したクラスタを割り当てる.
    ///
    /// 条件を満たす空き領域が存在しない場合には`None`が返される.
    /// このメソッドがマップを伸長することはない.
    pub fn allocate_before(&mut self, count: u64, limit: u64) -> Option<Allocation> {
        debug_assert!(count > 0);
        let previous_len = self.working.len_bytes();
        let from = self.hints.get(count);
        if let RunSearch::Found(start) = self.working.find_clear_run(from, count, Some(limit)) {
            self.working.set_range(start, count);
            self.hints.raise(count, start + count);
            Some(Allocation {
                start,
                count,
                previous_len,
            })
        } else {
            None
        }
    }

    /// 直前に行われた割当を取り消す.
    ///
    /// 割当によってマップが伸長されていた場合には、元の長さに戻される.
    pub fn rollback(&mut self, allocation: &Allocation) {
        self.working.clear_range(allocation.start, allocation.count);
        self.working.truncate_bytes(allocation.previous_len);
        self.hints.clear();
    }

    /// `start`から`count`個のクラスタを解放する.
    ///
    /// 解放は作業用マップにのみ反映される.
    ///
    /// # Errors
    ///
    /// 範囲がマップの外を指している場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// 範囲内に未割当のクラスタが含まれている場合(e.g., 二重解放)には、
    /// 種類が`ErrorKind::InconsistentState`のエラーが返される.
    pub fn release(&mut self, start: u64, count: u64) -> Result<()> {
        track_assert!(
            self.contains(start, count),
            ErrorKind::InvalidInput,
            "start={}, count={}, map_clusters={}",
            start,
            count,
            self.working.len_clusters()
        );
        track_assert!(
            self.working.is_range_set(start, count),
            ErrorKind::InconsistentState,
            "Not allocated: start={}, count={}",
            start,
            count
        );
        self.working.clear_range(start, count);

        let (run_start, run_end) = self.working.clear_run_around(start, count);
        self.hints.lower(run_end - run_start, run_start);
        Ok(())
    }

    /// 作業用マップを、`ranges`(`(開始位置, クラスタ数)`の列)のみが割当済みの状態に再構築する.
    ///
    /// # Errors
    ///
    /// `ranges`の要素がマップの外を指している場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// `ranges`の要素同士が重なっている場合には、種類が`ErrorKind::InconsistentState`のエラーが返される.
    ///
    /// いずれの場合も、作業用マップは変更されない.
    pub fn rebuild<I>(&mut self, ranges: I) -> Result<()>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut working = ClusterBitmap::with_len_bytes(self.working.len_bytes());
        for (start, count) in ranges {
            if count == 0 {
                continue;
            }
            track_assert!(
                self.contains(start, count),
                ErrorKind::InvalidInput,
                "Out of the map: start={}, count={}, map_clusters={}",
                start,
                count,
                self.working.len_clusters()
            );
            track_assert!(
                working.is_range_clear(start, count),
                ErrorKind::InconsistentState,
                "Overlapped: start={}, count={}",
                start,
                count
            );
            working.set_range(start, count);
        }
        self.working = working;
        self.hints.clear();
        Ok(())
    }

    /// 作業用マップの末尾の空き領域を切り詰める.
    ///
    /// 結果として、最後の割当済みクラスタの直後の位置が返される.
    pub fn trim_unused(&mut self) -> u64 {
        self.working.trim_trailing_free();
        self.hints.clear();
        self.working.allocated_end()
    }

    /// 作業用マップの内容を確定させる.
    ///
    /// マップファイルへの書き出しが成功した後に呼び出される.
    pub fn commit(&mut self) {
        self.committed = self.working.clone();
        self.hints.clear();
    }

    /// 作業用マップに、まだ確定されていない変更が存在するかどうかを返す.
    pub fn is_dirty(&self) -> bool {
        self.working != self.committed
    }

    /// 指定範囲が、作業用マップ上で全て割当済みかどうかを返す.
    pub fn is_allocated(&self, start: u64, count: u64) -> bool {
        self.working.is_range_set(start, count)
    }

    /// 指定範囲が、確定済みマップ上で全て割当済みかどうかを返す.
    pub fn is_durably_allocated(&self, start: u64, count: u64) -> bool {
        self.committed.is_range_set(start, count)
    }

    /// 作業用マップが管理しているクラスタ数を返す.
    pub fn len_clusters(&self) -> u64 {
        self.working.len_clusters()
    }

    // 範囲が作業用マップ内に収まっているかどうか.
    fn contains(&self, start: u64, count: u64) -> bool {
        start
            .checked_add(count)
            .map_or(false, |end| end <= self.working.len_clusters())
    }

    /// 作業用マップを返す.
    pub fn working(&self) -> &ClusterBitmap {
        &self.working
    }

    /// 確定済みマップを返す.
    pub fn committed(&self) -> &ClusterBitmap {
        &self.committed
    }
}
impl Default for FreeMap {
    fn default() -> Self {
        Self::new()
    }
}

/// `FreeMap`による割当の結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    start: u64,
    count: u64,
    previous_len: usize,
}
impl Allocation {
    /// 割り当てられた領域の開始位置(クラスタ単位).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// 割り当てられたクラスタ数.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 割り当てられた領域の終端位置(クラスタ単位).
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// 割当が、割当前のマップの最終バイト以降に及んでいるかどうかを返す.
    ///
    /// これが`true`の場合には、割当範囲がボックスファイルの末尾を超えている可能性がある.
    pub fn reaches_map_tail(&self) -> bool {
        self.end() > self.previous_len.saturating_sub(1) as u64 * 8
    }
}
