use std::path::{Path, PathBuf};

use crate::file::{existing_numbered_paths, numbered_path};

/// ストレージを構成するファイル群のパス.
///
/// ボックスファイルは`{dir}/{name}.{box_extension}`、
/// マップファイルは`{dir}/{name}.{map_extension}`に配置される.
///
/// ボックスファイルが分割されている場合、実際の物理ファイルは
/// ボックスファイルのパスに番号を挿入したもの(e.g., `inbox000.box`)となる.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    dir: PathBuf,
    name: String,
    box_extension: String,
    map_extension: String,
}
impl StoragePaths {
    /// 新しい`StoragePaths`インスタンスを生成する.
    pub fn new<P: AsRef<Path>>(dir: P, name: &str, box_extension: &str, map_extension: &str) -> Self {
        StoragePaths {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_owned(),
            box_extension: box_extension.to_owned(),
            map_extension: map_extension.to_owned(),
        }
    }

    /// ストレージが配置されるディレクトリを返す.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// ストレージの名前を返す.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ボックスファイルのパスを返す.
    pub fn box_path(&self) -> PathBuf {
        self.with_extension(&self.box_extension)
    }

    /// マップファイルのパスを返す.
    pub fn map_path(&self) -> PathBuf {
        self.with_extension(&self.map_extension)
    }

    /// 拡張子はそのままに、配置場所と名前を変更したインスタンスを返す.
    pub fn relocated<P: AsRef<Path>>(&self, dir: P, name: &str) -> Self {
        StoragePaths::new(dir, name, &self.box_extension, &self.map_extension)
    }

    /// ボックスファイルを構成する物理ファイルのうち、実際に存在するもののパスを返す.
    ///
    /// `divided`が`true`の場合には、番号付きの物理ファイル群が対象となる.
    pub fn existing_box_files(&self, divided: bool) -> Vec<PathBuf> {
        let box_path = self.box_path();
        if divided {
            existing_numbered_paths(&box_path)
        } else if box_path.exists() {
            vec![box_path]
        } else {
            Vec::new()
        }
    }

    /// 分割されたボックスファイルの、`index`番目の物理ファイルのパスを返す.
    pub fn numbered_box_path(&self, index: usize) -> PathBuf {
        numbered_path(&self.box_path(), index)
    }

    fn with_extension(&self, extension: &str) -> PathBuf {
        if extension.is_empty() {
            self.dir.join(&self.name)
        } else {
            self.dir.join(format!("{}.{}", self.name, extension))
        }
    }
}
