use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::file::{StorageFile, StorageFileBuilder};
use crate::Result;

/// 単一の物理ファイルによる`StorageFile`の実装.
///
/// 書き込みに応じてファイルは伸長し、サイズの上限は設けていない.
#[derive(Debug)]
pub struct SingleFile {
    file: File,
    path: PathBuf,
    cursor_position: u64,
}
impl SingleFile {
    /// デフォルト設定で`path`を開いて`SingleFile`インスタンスを生成する.
    ///
    /// ファイルが存在しない場合には、新規に作成される.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        StorageFileBuilder::new().open_single(path)
    }

    pub(crate) fn new(file: File, path: PathBuf) -> Self {
        SingleFile {
            file,
            path,
            cursor_position: 0,
        }
    }

    /// 実体ファイルのパスを返す.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルのサイズを`len`に変更する.
    ///
    /// カーソルの位置は変更されない.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        track_io!(self.file.set_len(len))
    }

    fn seek_impl(&mut self, position: u64) -> Result<()> {
        track_io!(self.file.seek(SeekFrom::Start(position)))?;
        self.cursor_position = position;
        Ok(())
    }
    fn read_impl(&mut self, buf: &mut [u8]) -> Result<usize> {
        let read_size = track_io!(self.file.read(buf))?;
        self.cursor_position += read_size as u64;
        Ok(read_size)
    }
    fn write_impl(&mut self, buf: &[u8]) -> Result<usize> {
        let written_size = track_io!(self.file.write(buf))?;
        self.cursor_position += written_size as u64;
        Ok(written_size)
    }
}
impl StorageFile for SingleFile {
    fn position(&self) -> u64 {
        self.cursor_position
    }
    fn size(&mut self) -> Result<u64> {
        let metadata = track_io!(self.file.metadata())?;
        Ok(metadata.len())
    }
    fn set_end_of_file(&mut self) -> Result<()> {
        let position = self.cursor_position;
        track!(self.set_len(position))
    }
    fn sync(&mut self) -> Result<()> {
        track_io!(self.file.sync_data())?;
        Ok(())
    }
}
impl Seek for SingleFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.convert_to_offset(pos)?;
        track!(self.seek_impl(position))?;
        Ok(position)
    }
}
impl Read for SingleFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_size = track!(self.read_impl(buf))?;
        Ok(read_size)
    }
}
impl Write for SingleFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written_size = track!(self.write_impl(buf))?;
        Ok(written_size)
    }
    fn flush(&mut self) -> io::Result<()> {
        track_io!(self.file.flush())?;
        Ok(())
    }
}
