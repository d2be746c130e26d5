//! 单例文件锁
//!
//! 用文件锁保证同一台主机上只有一个守护进程实例。进程崩溃时
//! 操作系统自动释放锁，比 PID 文件探测可靠。

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};

/// 单例文件锁
pub struct SingletonLock {
    file: File,
    _path: std::path::PathBuf,
}

impl SingletonLock {
    /// 尝试获取单例锁（非阻塞）
    ///
    /// 锁已被其他进程持有时返回 `AlreadyExists`。
    pub fn try_lock(lock_path: impl AsRef<std::path::Path>) -> Result<Self, io::Error> {
        let path = lock_path.as_ref();

        // 拿到锁之前不截断：文件里可能是另一个活着的实例的 PID
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "daemon is already running (lock held)",
            ));
        }

        // 锁到手后清掉残留内容，写入本进程 PID
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            _path: path.to_path_buf(),
        })
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
