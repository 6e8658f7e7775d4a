//! マップファイルの読み書き.
//!
//! マップファイルの中身は、空き領域ビットマップのバイト列そのままであり、ヘッダ等は持たない.
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::Result;

/// マップファイルを読み込む.
///
/// ファイルが存在しない場合には`None`が返される.
pub fn load(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(ref e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(track!(crate::Error::from(e))),
    }
}

/// マップファイルを書き出す.
///
/// 内容は同じディレクトリ内の一時ファイルに書き込まれた後に、
/// リネームによって既存のファイルと置き換えられる.
/// そのため、書き込み途中の状態のマップファイルが観測されることはない.
pub fn save(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    track_io!(fs::create_dir_all(dir))?;

    let mut temp = track_io!(NamedTempFile::new_in(dir))?;
    track_io!(temp.write_all(bytes))?;
    track_io!(temp.as_file().sync_data())?;
    track_io!(temp.persist(path).map_err(|e| e.error))?;
    Ok(())
}
