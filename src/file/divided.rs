use std::cmp;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::file::{SingleFile, StorageFile, StorageFileBuilder};
use crate::Result;

/// 基点となるパスに対応する、`index`番目の物理ファイルのパスを返す.
///
/// 番号は三桁の十進数で、ファイル名の最初の`.`の直前に挿入される.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use clusterstore::file::numbered_path;
///
/// assert_eq!(numbered_path(Path::new("mail/inbox.box"), 0), Path::new("mail/inbox000.box"));
/// assert_eq!(numbered_path(Path::new("mail/inbox.box"), 12), Path::new("mail/inbox012.box"));
/// assert_eq!(numbered_path(Path::new("mail/inbox"), 3), Path::new("mail/inbox003"));
/// ```
pub fn numbered_path(path: &Path, index: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, extension) = match name.find('.') {
        Some(i) => name.split_at(i),
        None => (&name[..], ""),
    };
    path.with_file_name(format!("{}{:03}{}", stem, index, extension))
}

/// 基点となるパスに対応する物理ファイルのうち、実際に存在するもののパスを番号順に返す.
///
/// `0`番から順に存在を確認し、最初に見つからなかった番号で列挙を終える.
pub fn existing_numbered_paths(path: &Path) -> Vec<PathBuf> {
    (0..)
        .map(|i| numbered_path(path, i))
        .take_while(|p| p.exists())
        .collect()
}

/// 論理的なバイト列を、固定長の複数の物理ファイルに分割して格納する`StorageFile`の実装.
///
/// 論理オフセット`o`は、`o / block_size`番目の物理ファイルの`o % block_size`の位置に対応する.
///
/// 末尾以外の物理ファイルは、常に`block_size`の長さを持つ.
/// 後方のファイルへの書き込みが行われる際には、それより前の物理ファイルが
/// 必要に応じて作成・伸長される.
#[derive(Debug)]
pub struct DividedFile {
    path: PathBuf,
    block_size: u64,
    builder: StorageFileBuilder,
    files: Vec<Option<SingleFile>>,
    padded_files: usize,
    cursor_position: u64,
}
impl DividedFile {
    /// デフォルト設定で`path`を基点とする`DividedFile`インスタンスを生成する.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u64) -> Result<Self> {
        StorageFileBuilder::new().open_divided(path, block_size)
    }

    pub(crate) fn new(path: PathBuf, block_size: u64, builder: StorageFileBuilder) -> Self {
        DividedFile {
            path,
            block_size,
            builder,
            files: Vec::new(),
            padded_files: 0,
            cursor_position: 0,
        }
    }

    /// 基点となるパスを返す.
    ///
    /// このパス自体に対応するファイルは作成されない.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 物理ファイル一つ当たりのサイズを返す.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn open_file(&mut self, index: usize) -> Result<&mut SingleFile> {
        if self.files.len() <= index {
            self.files.resize_with(index + 1, || None);
        }
        let slot = &mut self.files[index];
        let file = match slot.take() {
            Some(file) => file,
            None => track!(self.builder.open_single(numbered_path(&self.path, index)))?,
        };
        Ok(slot.get_or_insert(file))
    }

    fn existing_file(&mut self, index: usize) -> Result<Option<&mut SingleFile>> {
        if self.files.len() <= index {
            self.files.resize_with(index + 1, || None);
        }
        let slot = &mut self.files[index];
        let file = match slot.take() {
            Some(file) => Some(file),
            None => track!(self.builder.open_existing(numbered_path(&self.path, index)))?,
        };
        *slot = file;
        Ok(slot.as_mut())
    }

    // `index`より前の物理ファイル群が全て`block_size`の長さを持つようにする.
    fn pad_preceding_files(&mut self, index: usize) -> Result<()> {
        let block_size = self.block_size;
        for i in self.padded_files..index {
            let file = track!(self.open_file(i))?;
            if track!(file.size())? < block_size {
                track!(file.set_len(block_size))?;
            }
        }
        self.padded_files = cmp::max(self.padded_files, index);
        Ok(())
    }

    fn locate(&self, position: u64) -> (usize, u64) {
        (
            (position / self.block_size) as usize,
            position % self.block_size,
        )
    }

    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (index, inner) = self.locate(self.cursor_position);
        let len = cmp::min(buf.len() as u64, self.block_size - inner) as usize;
        let read_size = match track!(self.existing_file(index))? {
            None => 0,
            Some(file) => {
                track_io!(file.seek(SeekFrom::Start(inner)))?;
                track_io!(file.read(&mut buf[..len]))?
            }
        };
        self.cursor_position += read_size as u64;
        Ok(read_size)
    }

    fn write_impl(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (index, inner) = self.locate(self.cursor_position);
        let len = cmp::min(buf.len() as u64, self.block_size - inner) as usize;
        track!(self.pad_preceding_files(index))?;

        let file = track!(self.open_file(index))?;
        track_io!(file.seek(SeekFrom::Start(inner)))?;
        track_io!(file.write_all(&buf[..len]))?;
        self.cursor_position += len as u64;
        Ok(len)
    }
}
impl StorageFile for DividedFile {
    fn position(&self) -> u64 {
        self.cursor_position
    }
    fn size(&mut self) -> Result<u64> {
        let paths = existing_numbered_paths(&self.path);
        if let Some(last) = paths.last() {
            let metadata = track_io!(fs::metadata(last))?;
            Ok((paths.len() as u64 - 1) * self.block_size + metadata.len())
        } else {
            Ok(0)
        }
    }
    fn set_end_of_file(&mut self) -> Result<()> {
        let (index, inner) = self.locate(self.cursor_position);
        track!(self.pad_preceding_files(index))?;
        let retained_files = if inner == 0 && index > 0 {
            // ちょうど境界上の場合には、空の物理ファイルは作らない
            index
        } else {
            track!(self.open_file(index).and_then(|file| file.set_len(inner)))?;
            index + 1
        };

        self.padded_files = cmp::min(self.padded_files, index);

        // 後続の物理ファイルは全て削除する
        self.files.truncate(retained_files);
        for path in existing_numbered_paths(&self.path)
            .into_iter()
            .skip(retained_files)
        {
            track_io!(fs::remove_file(path))?;
        }
        Ok(())
    }
    fn sync(&mut self) -> Result<()> {
        for file in self.files.iter_mut().filter_map(|f| f.as_mut()) {
            track!(file.sync())?;
        }
        Ok(())
    }
}
impl Seek for DividedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        self.cursor_position = position;
        Ok(position)
    }
}
impl Read for DividedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_size = track!(self.read_impl(buf))?;
        Ok(read_size)
    }
}
impl Write for DividedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = track!(self.write_impl(buf))?;
        Ok(written_size)
    }
    fn flush(&mut self) -> io::Result<()> {
        for file in self.files.iter_mut().filter_map(|f| f.as_mut()) {
            file.flush()?;
        }
        Ok(())
    }
}
