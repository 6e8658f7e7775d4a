use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else if is_no_space(&e) {
            ErrorKind::StorageFull.cause(e).into()
        } else {
            ErrorKind::Other.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}

#[cfg(unix)]
fn is_no_space(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}
#[cfg(not(unix))]
fn is_no_space(_e: &std::io::Error) -> bool {
    false
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// ボックスファイルを拡張するための空き容量がない.
    ///
    /// 新規レコードの割当時に、ファイル末尾の拡張が失敗した場合に返される.
    /// この時点で、仮に行われた割当はロールバックされている.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者が不要なレコードを解放した上で`free_unused`を実行する
    /// - ディスクの空き容量を増やす
    StorageFull,

    /// ストレージが破損している.
    ///
    /// マップファイル上は割当済みのクラスタが存在するのに、
    /// ボックスファイルが見つからない場合等に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - マップファイルを削除して、上位層のインデックスから再構築する
    StorageCorrupted,

    /// 入力が不正.
    ///
    /// クラスタ境界に揃っていないオフセットや、長さ`0`のレコード、
    /// マップの範囲外を指す領域等が指定された場合に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// 二重解放や、未割当領域の解放・読み込み等、
    /// 利用者側のインデックスとマップの内容が食い違っていることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    /// - `free_unreferenced`でマップを再構築する
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., I/Oエラー
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
