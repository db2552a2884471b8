use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;

/// Global file logger; `None` until `init` runs, in which case the macros
/// only echo to the console.
static FILE_LOGGER: Lazy<Mutex<Option<FileLogger>>> = Lazy::new(|| Mutex::new(None));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

struct FileLogger {
    path: PathBuf,
    min_level: Level,
}

impl FileLogger {
    fn write(&self, level: Level, message: &str) {
        if level < self.min_level {
            return;
        }
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let line = format!("[{}] [{}] {}\n", timestamp, level.tag(), message);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Route log output to a file in addition to the console. Creates the parent
/// directory if needed and verifies the file is writable.
pub fn init(path: PathBuf, min_level: Level) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create log directory: {}", e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))?;

    *FILE_LOGGER.lock().unwrap() = Some(FileLogger { path, min_level });
    log(Level::Info, "file logging initialized");
    Ok(())
}

pub fn log(level: Level, message: &str) {
    match level {
        Level::Warn | Level::Error => eprintln!("[{}] {}", level.tag(), message),
        _ => println!("[{}] {}", level.tag(), message),
    }
    if let Ok(guard) = FILE_LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.write(level, message);
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Level::Error, &format!($($arg)*))
    };
}
