use std::cmp;
use std::iter;

/// 一クラスタを一ビットで表現するビットマップ.
///
/// ビットが`1`のクラスタは割当済み、`0`のクラスタは空きを意味する.
///
/// バイト内のビット順はMSB-firstで、`i`番目のクラスタは`i / 8`バイト目の
/// `0x80 >> (i % 8)`のビットに対応する.
/// この並びは、そのままマップファイルの内容となる.
///
/// ビットマップの長さは常にバイト単位(i.e., 八クラスタ単位)で管理され、
/// 末尾を超えた位置のクラスタは、全て空きとして扱われる.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterBitmap {
    bytes: Vec<u8>,
}
impl ClusterBitmap {
    /// 空のビットマップを生成する.
    pub fn new() -> Self {
        ClusterBitmap { bytes: Vec::new() }
    }

    /// バイト列(マップファイルの内容)からビットマップを生成する.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ClusterBitmap { bytes }
    }

    /// 全てのクラスタが空きの、`len`バイト長のビットマップを生成する.
    pub fn with_len_bytes(len: usize) -> Self {
        ClusterBitmap {
            bytes: vec![0; len],
        }
    }

    /// ビットマップの内容をバイト列として返す.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// ビットマップのバイト長を返す.
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// ビットマップが管理しているクラスタ数を返す.
    pub fn len_clusters(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }

    /// `cluster`が割当済みかどうかを返す.
    pub fn get(&self, cluster: u64) -> bool {
        let mask = 0x80 >> (cluster % 8);
        self.bytes
            .get((cluster / 8) as usize)
            .map_or(false, |b| b & mask != 0)
    }

    /// `start`から`count`個のクラスタを割当済みにする.
    ///
    /// 範囲はビットマップ内に収まっている必要がある.
    pub fn set_range(&mut self, start: u64, count: u64) {
        debug_assert!(start + count <= self.len_clusters());
        for (i, mask) in byte_masks(start, count) {
            self.bytes[i] |= mask;
        }
    }

    /// `start`から`count`個のクラスタを空きにする.
    pub fn clear_range(&mut self, start: u64, count: u64) {
        for (i, mask) in byte_masks(start, count) {
            if let Some(b) = self.bytes.get_mut(i) {
                *b &= !mask;
            }
        }
    }

    /// 指定範囲のクラスタが全て割当済みかどうかを返す.
    pub fn is_range_set(&self, start: u64, count: u64) -> bool {
        start
            .checked_add(count)
            .map_or(false, |end| end <= self.len_clusters())
            && byte_masks(start, count).all(|(i, mask)| self.bytes[i] & mask == mask)
    }

    /// 指定範囲のクラスタが全て空きかどうかを返す.
    pub fn is_range_clear(&self, start: u64, count: u64) -> bool {
        byte_masks(start, count).all(|(i, mask)| self.bytes.get(i).map_or(true, |b| b & mask == 0))
    }

    /// 割当済みのクラスタ数を返す.
    pub fn count_set(&self) -> u64 {
        self.bytes.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// 最後の割当済みクラスタの直後の位置を返す.
    ///
    /// 割当済みのクラスタが存在しない場合には`0`が返される.
    pub fn allocated_end(&self) -> u64 {
        self.bytes
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i as u64 * 8 + 8 - u64::from(self.bytes[i].trailing_zeros()))
    }

    /// `clusters`個のクラスタを管理できるように、必要に応じてビットマップを伸長する.
    ///
    /// 伸長部分は全て空きとなる.
    pub fn grow_to(&mut self, clusters: u64) {
        let len = ((clusters + 7) / 8) as usize;
        if self.bytes.len() < len {
            self.bytes.resize(len, 0);
        }
    }

    /// ビットマップを`len`バイトに切り詰める.
    pub fn truncate_bytes(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    /// 末尾の全てのビットが空きのバイト群を取り除く.
    pub fn trim_trailing_free(&mut self) {
        let len = self.bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        self.bytes.truncate(len);
    }

    /// `from`以降で、`count`個の連続した空きクラスタを探す.
    ///
    /// `limit`が指定された場合には、その位置までに収まる範囲のみが対象となる.
    ///
    /// 全てのビットが`1`のバイトは、ビット単位の走査を行わずに読み飛ばされる.
    pub fn find_clear_run(&self, from: u64, count: u64, limit: Option<u64>) -> RunSearch {
        debug_assert!(count > 0);
        let end = limit.map_or(self.len_clusters(), |limit| {
            cmp::min(limit, self.len_clusters())
        });

        let mut run_start = from;
        let mut run_len = 0;
        let mut i = from;
        while i < end {
            if i % 8 == 0 && self.bytes[(i / 8) as usize] == 0xFF {
                i += 8;
                run_start = i;
                run_len = 0;
                continue;
            }
            if self.get(i) {
                run_start = i + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return RunSearch::Found(run_start);
                }
            }
            i += 1;
        }
        if limit.is_some() {
            RunSearch::Limited
        } else {
            RunSearch::NotFound
        }
    }

    /// ビットマップ末尾に連続する空きクラスタ群の開始位置を返す.
    pub fn trailing_clear_start(&self) -> u64 {
        let mut start = self.len_clusters();
        while start > 0 && !self.get(start - 1) {
            start -= 1;
        }
        start
    }

    /// 指定範囲を含む、空きクラスタの最大の連続領域を`(開始位置, 終端位置)`として返す.
    ///
    /// 指定範囲自体は空きである必要がある.
    pub fn clear_run_around(&self, start: u64, count: u64) -> (u64, u64) {
        let mut run_start = start;
        while run_start > 0 && !self.get(run_start - 1) {
            run_start -= 1;
        }
        let mut run_end = start + count;
        while run_end < self.len_clusters() && !self.get(run_end) {
            run_end += 1;
        }
        (run_start, run_end)
    }
}

/// `ClusterBitmap::find_clear_run`の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSearch {
    /// 指定位置から始まる空き領域が見つかった.
    Found(u64),

    /// ビットマップの末尾までに、十分な空き領域が見つからなかった.
    NotFound,

    /// 指定された上限位置までに、十分な空き領域が見つからなかった.
    Limited,
}

// 指定範囲に含まれるビット群を、バイト毎の`(位置, マスク)`として列挙する.
fn byte_masks(start: u64, count: u64) -> impl Iterator<Item = (usize, u8)> {
    let end = start.saturating_add(count);
    let mut position = start;
    iter::from_fn(move || {
        if position >= end {
            return None;
        }
        let bit = (position % 8) as u32;
        let n = cmp::min(8 - u64::from(bit), end - position) as u32;
        let mask = ((0xFFu16 >> bit) & !(0xFFu16 >> (bit + n))) as u8;
        let index = (position / 8) as usize;
        position += u64::from(n);
        Some((index, mask))
    })
}
