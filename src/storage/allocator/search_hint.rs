use std::cmp;

/// 探索開始位置ヒントのスロット数.
///
/// 最後のスロットは、このスロット数から一を引いた数以上のクラスタ数を要求する割当の全てで共有される.
pub const SEARCH_HINT_SLOTS: usize = 64;

/// 割当サイズ毎の探索開始位置ヒント.
///
/// `k`番目のスロットの値は、`k`個の連続した空きクラスタから成る領域が、
/// その位置より前には一つも存在しないことを保証する.
/// そのため割当時の走査は、ビットマップの先頭ではなく、このヒントの位置から開始することができる.
///
/// ヒントは保守的な値であれば良く、`0`は常に正しいヒントとなる.
#[derive(Clone)]
pub struct SearchHints {
    begins: [u64; SEARCH_HINT_SLOTS],
}
impl SearchHints {
    /// 全てのヒントが`0`のインスタンスを生成する.
    pub fn new() -> Self {
        SearchHints {
            begins: [0; SEARCH_HINT_SLOTS],
        }
    }

    /// `count`個のクラスタを割り当てる際の探索開始位置を返す.
    pub fn get(&self, count: u64) -> u64 {
        self.begins[slot(count)]
    }

    /// `count`個のクラスタの割当が、終端位置`end`で行われたことを反映する.
    ///
    /// ファーストフィットで見つかった割当であれば、`end`より前には
    /// `count`個以上の連続した空き領域は存在しないので、対応するヒントを前進させることができる.
    pub fn raise(&mut self, count: u64, end: u64) {
        if count >= SEARCH_HINT_SLOTS as u64 - 1 {
            // 最後のスロットが保証するサイズよりも大きな割当からは、何も言えない
            return;
        }
        for begin in &mut self.begins[slot(count)..] {
            *begin = cmp::max(*begin, end);
        }
    }

    /// 位置`start`から始まる長さ`len`の空き領域が生じたことを反映する.
    pub fn lower(&mut self, len: u64, start: u64) {
        let last = slot(len);
        for begin in &mut self.begins[1..=last] {
            *begin = cmp::min(*begin, start);
        }
    }

    /// 全てのヒントを破棄する.
    pub fn clear(&mut self) {
        self.begins = [0; SEARCH_HINT_SLOTS];
    }
}
impl Default for SearchHints {
    fn default() -> Self {
        Self::new()
    }
}
impl std::fmt::Debug for SearchHints {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.begins.iter()).finish()
    }
}

fn slot(count: u64) -> usize {
    cmp::min(count, SEARCH_HINT_SLOTS as u64 - 1) as usize
}
