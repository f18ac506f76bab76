use tracing::{debug, info};

/// Position of the loader inside the current seed file and across the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemProgress {
    pub file_index: usize,
    pub item_index: usize,
    pub items_in_file: usize,
    pub items_done: usize,
}

/// Observer for seed loader progress. The loader only emits events.
pub trait SeedProgress: Send + Sync {
    fn on_file_progress(&self, done: usize, total: usize, file: &str);
    fn on_item_progress(&self, progress: ItemProgress);
}

/// Progress reported through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LogProgress {
    /// Emit an item event every `every` items.
    pub every: usize,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self { every: 500 }
    }
}

impl SeedProgress for LogProgress {
    fn on_file_progress(&self, done: usize, total: usize, file: &str) {
        debug!(target = "seed", done, total, file, "seed file processed");
        if done == total || done % 100 == 0 {
            info!(target = "seed", done, total, "files progress");
        }
    }

    fn on_item_progress(&self, progress: ItemProgress) {
        if self.every > 0 && progress.items_done % self.every == 0 {
            info!(
                target = "seed",
                items = progress.items_done,
                file = progress.file_index,
                "items progress"
            );
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl SeedProgress for NoProgress {
    fn on_file_progress(&self, _done: usize, _total: usize, _file: &str) {}
    fn on_item_progress(&self, _progress: ItemProgress) {}
}
