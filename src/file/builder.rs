use std::fs::{self, File};
#[cfg(unix)]
use std::io;
use std::path::Path;

use crate::file::{DividedFile, SingleFile};
use crate::{ErrorKind, Result};

/// `SingleFile`および`DividedFile`のビルダ.
///
/// exclusive_lock: 物理ファイルに対するアクセスの排他制御を行うかどうか
///
/// ストレージ自体は複数プロセスからの同時アクセスをサポートしないので、
/// 排他ロックは誤用を早期に検出するための補助的な機能となる.
#[derive(Debug, Clone)]
pub struct StorageFileBuilder {
    exclusive_lock: bool,
}
impl StorageFileBuilder {
    /// デフォルト設定で`StorageFileBuilder`インスタンスを作成する.
    ///
    /// デフォルトでは、exclusive_lock = falseとなる.
    pub fn new() -> Self {
        StorageFileBuilder {
            exclusive_lock: false,
        }
    }

    /// exclusive_lockのon/offを設定する.
    pub fn exclusive_lock(&mut self, enabled: bool) -> &mut Self {
        self.exclusive_lock = enabled;
        self
    }

    /// `path`を読み書きモードで開いて`SingleFile`インスタンスを生成する.
    ///
    /// ファイル(および親ディレクトリ)が存在しない場合には、新規に作成される.
    pub fn open_single<P: AsRef<Path>>(&self, path: P) -> Result<SingleFile> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            track_io!(fs::create_dir_all(dir))?;
        }
        let file = track_io!(fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path))?;
        track!(self.set_exclusive_file_lock_if_flag_is_on(&file))?;
        Ok(SingleFile::new(file, path.to_path_buf()))
    }

    /// `path`が存在する場合に限り、それを開いて`SingleFile`インスタンスを生成する.
    pub fn open_existing<P: AsRef<Path>>(&self, path: P) -> Result<Option<SingleFile>> {
        if path.as_ref().exists() {
            track!(self.open_single(path)).map(Some)
        } else {
            Ok(None)
        }
    }

    /// `path`を基点とする`DividedFile`インスタンスを生成する.
    ///
    /// 物理ファイルは、必要になった時点で開かれる(ないし作成される).
    ///
    /// # Errors
    ///
    /// `block_size`が`0`の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn open_divided<P: AsRef<Path>>(&self, path: P, block_size: u64) -> Result<DividedFile> {
        track_assert_ne!(block_size, 0, ErrorKind::InvalidInput);
        Ok(DividedFile::new(
            path.as_ref().to_path_buf(),
            block_size,
            self.clone(),
        ))
    }

    #[cfg(unix)]
    fn set_exclusive_file_lock_if_flag_is_on(&self, file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if self.exclusive_lock {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                track_io!(Err(io::Error::last_os_error()))
            } else {
                Ok(())
            }
        } else {
            Ok(())
        }
    }
    #[cfg(not(unix))]
    fn set_exclusive_file_lock_if_flag_is_on(&self, _file: &File) -> Result<()> {
        Ok(())
    }
}
impl Default for StorageFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
