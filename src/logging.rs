use std::sync::{Arc, Mutex, MutexGuard};

// log macros to check if log and log channel is enabled before performing potentially expensive string formatting
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;

/// User facing output of a save. Messages go through the active progress bar when there is one.
#[derive(Clone, Default)]
pub struct Log {
    verbose: bool,
    debug: bool,
    progress: Arc<Mutex<Option<indicatif::ProgressBar>>>,
}
impl Log {
    pub fn new(verbose: bool, debug: bool) -> Self {
        Self { verbose, debug, progress: Default::default() }
    }
    fn progress(&self) -> MutexGuard<'_, Option<indicatif::ProgressBar>> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    pub fn set_progress(&self, progress: Option<&indicatif::ProgressBar>) {
        *self.progress() = progress.cloned();
    }
    pub fn log(&self, msg: &str) {
        if let Some(progress) = self.progress().as_ref() {
            progress.println(msg);
        } else {
            println!("{msg}");
        }
    }
    pub fn verbose_enabled(&self) -> bool {
        self.verbose
    }
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}
