//! 跨进程文件存储
//!
//! 同一节点上的多个 worker 进程共享一个 JSON 文件（键 -> 字符串值）。
//! 每次读改写都持有文件的排他锁（fs2），因此 `compare_set` 在进程间是线性一致的。

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::StoreError;

/// CAS 结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// 替换成功
    Swapped,
    /// 当前值与期望值不一致，附带当前值
    Conflict { current: Option<String> },
}

/// 支持比较并设置的键值存储
pub trait CompareSetStore: Send + Sync {
    /// 读取键的当前值
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 当键的当前值等于 `expected` 时写入 `desired`
    ///
    /// `expected` 为 `None` 表示期望键不存在。
    fn compare_set(
        &self,
        key: &str,
        expected: Option<&str>,
        desired: &str,
    ) -> Result<CasOutcome, StoreError>;
}

type Entries = BTreeMap<String, String>;

/// 基于文件锁的存储
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// 打开（必要时创建）存储文件
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        tracing::debug!("[FileStore] 打开会话存储: {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> Result<File, StoreError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }

    fn read_entries(file: &mut File) -> Result<Entries, StoreError> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(Entries::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_entries(file: &mut File, entries: &Entries) -> Result<(), StoreError> {
        let content = serde_json::to_vec(entries)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&content)?;
        file.sync_data()?;
        Ok(())
    }

    /// 在排他锁内执行一次读改写，闭包返回 `true` 时写回
    fn with_exclusive<T>(
        &self,
        f: impl FnOnce(&mut Entries) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut file = self.open_file()?;
        FileExt::lock_exclusive(&file)?;

        let result: Result<T, StoreError> = (|| {
            let mut entries = Self::read_entries(&mut file)?;
            let (value, dirty) = f(&mut entries);
            if dirty {
                Self::write_entries(&mut file, &entries)?;
            }
            Ok(value)
        })();

        FileExt::unlock(&file)?;
        result
    }
}

impl CompareSetStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut file = self.open_file()?;
        FileExt::lock_shared(&file)?;
        let entries = Self::read_entries(&mut file);
        FileExt::unlock(&file)?;
        Ok(entries?.get(key).cloned())
    }

    fn compare_set(
        &self,
        key: &str,
        expected: Option<&str>,
        desired: &str,
    ) -> Result<CasOutcome, StoreError> {
        self.with_exclusive(|entries| {
            let current = entries.get(key).map(String::as_str);
            if current == expected {
                entries.insert(key.to_string(), desired.to_string());
                (CasOutcome::Swapped, true)
            } else {
                (
                    CasOutcome::Conflict {
                        current: current.map(str::to_string),
                    },
                    false,
                )
            }
        })
    }
}
